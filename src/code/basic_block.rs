use crate::code::Label;
use crate::util::{Offset, OffsetVec, Width};
use std::collections::HashMap;

/// A maximal straight-line run of instructions, closed by exactly one branch
///
/// A method body is an ordered sequence of these, discovered lazily while
/// consuming visitor events: placing a label or visiting a branch closes the
/// block under construction.
#[derive(Debug, PartialEq, Clone)]
pub struct BasicBlock<Insn, BrInsn> {
    /// Straight-line instructions in the block
    pub instructions: OffsetVec<Insn>,

    /// Branch instruction closing the block
    pub branch_end: BrInsn,
}

impl<Insn: Width, BrInsn: Width> Width for BasicBlock<Insn, BrInsn> {
    fn width(&self) -> usize {
        self.instructions.offset_len().0 + self.branch_end.width()
    }
}

impl<Insn: Width, BrInsn: Width> BasicBlock<Insn, BrInsn> {
    /// Given an expected order of blocks, compute the offset of every basic
    /// block with respect to the start of the method
    pub fn compute_block_offsets(
        block_layout_order: &[Label],
        blocks: &HashMap<Label, BasicBlock<Insn, BrInsn>>,
    ) -> HashMap<Label, Offset> {
        let mut block_offsets: HashMap<Label, Offset> = HashMap::new();
        let mut offset = Offset(0);
        for block_lbl in block_layout_order {
            block_offsets.insert(*block_lbl, offset);
            offset.0 += blocks[block_lbl].width();
        }
        block_offsets
    }
}
