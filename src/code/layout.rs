//! Final layout of basic blocks: switch padding and oversized-jump widening
//!
//! Most branch instructions carry a signed 16-bit relative offset. When a
//! method body grows past what that can express, the offending jumps are
//! rewritten in terms of `goto_w`:
//!
//! ```text,ignore,no_run
//!                           nop
//!                           nop
//!     goto L2               goto_w L2
//! L1: ...         =>    L1: ...
//! ```
//!
//! ```text,ignore,no_run
//!                           ifnot* L4
//!     if* L2            L3: goto L1
//! L1: ...         =>    L4: goto_w L2
//!     ...                L1: ...
//! ```
//!
//! Every rewrite inserts a multiple of four bytes (`nop` padding for the
//! `goto` case), so `tableswitch`/`lookupswitch` padding fixed before this
//! pass stays correct. Rewriting can push other jumps out of range, so the
//! pass relays out and rescans until nothing is oversized. This terminates:
//! the set of rewritable 16-bit jumps only ever shrinks, because a rewritten
//! jump becomes `goto_w` (out of consideration) and the extra 16-bit jumps a
//! rewrite introduces only span small fixed distances.

use crate::code::{
    BasicBlock, BranchInstruction, Instruction, JumpTargets, Label, LabelArena,
    SerializableInstruction,
};
use crate::util::Width;
use std::collections::{HashMap, HashSet};
use std::ops::{RangeBounds, RangeInclusive};

pub type LayoutBlock = BasicBlock<SerializableInstruction, BranchInstruction<Label, Label, Label>>;

/// Range of relative offsets supported by `goto` and `if*` instructions
pub const SIGNED_16BIT_JUMP_RANGE: RangeInclusive<isize> =
    RangeInclusive::new(i16::MIN as isize, i16::MAX as isize);

/// Fix the padding of every `tableswitch`/`lookupswitch` so their operands
/// sit at offsets that are a multiple of four from the start of the method
///
/// A single forward pass suffices: by the time a block's offset is reached,
/// all earlier paddings are final.
pub fn fix_switch_padding(block_order: &[Label], blocks: &mut HashMap<Label, LayoutBlock>) {
    let mut offset = 0;
    for block_lbl in block_order {
        let block = blocks.get_mut(block_lbl).expect("missing block");
        let operands_start = offset + block.instructions.offset_len().0 + 1;
        let padding = match (operands_start % 4) as u8 {
            0 => 0,
            x => 4 - x,
        };
        block.branch_end.set_padding(padding);
        offset += block.width();
    }
}

/// Detect which jumps are oversized and rewrite them, iterating until every
/// remaining 16-bit jump is in range
///
/// New trampoline blocks get labels from the arena, which is why the arena is
/// a parameter. The `small_jump_range` parameter should always be
/// [`SIGNED_16BIT_JUMP_RANGE`]; it is a parameter only for unit tests.
pub fn widen_oversized_jumps(
    block_order: &mut Vec<Label>,
    blocks: &mut HashMap<Label, LayoutBlock>,
    arena: &mut LabelArena,
    small_jump_range: &impl RangeBounds<isize>,
) {
    loop {
        let offsets = BasicBlock::compute_block_offsets(block_order, blocks);

        // Blocks whose closing jump no longer fits in a signed 16-bit offset
        let oversized: HashSet<Label> = blocks
            .iter()
            .filter_map(|(block_lbl, block)| match block.branch_end.jump_targets() {
                JumpTargets::Regular(target) => {
                    let from = offsets[block_lbl].0 + block.instructions.offset_len().0;
                    let distance = offsets[&target].0 as isize - from as isize;
                    if small_jump_range.contains(&distance) {
                        None
                    } else {
                        Some(*block_lbl)
                    }
                }
                _ => None,
            })
            .collect();
        if oversized.is_empty() {
            return;
        }

        // Rewrite in layout order so trampoline labels come out deterministic
        let mut widen_branch: HashMap<Label, (Label, Label)> = HashMap::new();
        for block_lbl in block_order.iter() {
            if !oversized.contains(block_lbl) {
                continue;
            }
            let block = blocks.get_mut(block_lbl).expect("missing block");
            match &block.branch_end {
                BranchInstruction::Goto(target) => {
                    let target = *target;
                    block.instructions.push(Instruction::Nop);
                    block.instructions.push(Instruction::Nop);
                    block.branch_end = BranchInstruction::GotoW(target);
                }
                conditional => {
                    let near_lbl = arena.fresh_label();
                    let far_lbl = arena.fresh_label();
                    let (new_branch_end, next, far) = match conditional {
                        BranchInstruction::If(comp, far, next) => {
                            (BranchInstruction::If(!*comp, far_lbl, near_lbl), *next, *far)
                        }
                        BranchInstruction::IfICmp(comp, far, next) => (
                            BranchInstruction::IfICmp(!*comp, far_lbl, near_lbl),
                            *next,
                            *far,
                        ),
                        BranchInstruction::IfACmp(comp, far, next) => (
                            BranchInstruction::IfACmp(!*comp, far_lbl, near_lbl),
                            *next,
                            *far,
                        ),
                        BranchInstruction::IfNull(comp, far, next) => (
                            BranchInstruction::IfNull(!*comp, far_lbl, near_lbl),
                            *next,
                            *far,
                        ),
                        other => unreachable!("cannot widen branch {:?}", other),
                    };
                    block.branch_end = new_branch_end;
                    widen_branch.insert(*block_lbl, (near_lbl, far_lbl));

                    blocks.insert(
                        near_lbl,
                        BasicBlock {
                            instructions: Default::default(),
                            branch_end: BranchInstruction::Goto(next),
                        },
                    );
                    blocks.insert(
                        far_lbl,
                        BasicBlock {
                            instructions: Default::default(),
                            branch_end: BranchInstruction::GotoW(far),
                        },
                    );
                }
            }
        }

        // Splice trampolines right after the blocks they were split out of
        if !widen_branch.is_empty() {
            let mut new_block_order: Vec<Label> = Vec::with_capacity(block_order.len());
            for lbl in block_order.iter() {
                new_block_order.push(*lbl);
                if let Some((near_lbl, far_lbl)) = widen_branch.get(lbl) {
                    new_block_order.push(*near_lbl);
                    new_block_order.push(*far_lbl);
                }
            }
            *block_order = new_block_order;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::code::OrdComparison;

    fn dummy_block(len: usize, branch_end: BranchInstruction<Label, Label, Label>) -> LayoutBlock {
        let first_nop = if len % 2 == 0 {
            None
        } else {
            Some(Instruction::Nop)
        };
        BasicBlock {
            instructions: first_nop
                .into_iter()
                .chain((0..len / 2).flat_map(|_| [Instruction::IConst2, Instruction::Pop]))
                .collect(),
            branch_end,
        }
    }

    fn assert_all_jumps_in_range(block_order: &[Label], blocks: &HashMap<Label, LayoutBlock>) {
        let offsets = BasicBlock::compute_block_offsets(block_order, blocks);
        for (lbl, block) in blocks {
            match block.branch_end.jump_targets() {
                JumpTargets::Regular(target) => {
                    let from = offsets[lbl].0 + block.instructions.offset_len().0;
                    let distance = offsets[&target].0 as isize - from as isize;
                    assert!(
                        SIGNED_16BIT_JUMP_RANGE.contains(&distance),
                        "jump from {:?} is still oversized ({})",
                        lbl,
                        distance
                    );
                }
                _ => (),
            }
        }
    }

    #[test]
    fn small_jumps_unchanged() {
        let mut generator = crate::code::LabelGenerator::new();
        let l0 = generator.fresh_label();
        let l1 = generator.fresh_label();
        let l2 = generator.fresh_label();

        let mut block_order = vec![l0, l1, l2];
        let mut blocks = HashMap::from([
            (
                l0,
                dummy_block(2, BranchInstruction::If(OrdComparison::LT, l2, l1)),
            ),
            (l1, dummy_block(2, BranchInstruction::Return)),
            (l2, dummy_block(2, BranchInstruction::Goto(l1))),
        ]);
        let before = blocks.clone();

        let mut arena = LabelArena::new();
        widen_oversized_jumps(
            &mut block_order,
            &mut blocks,
            &mut arena,
            &SIGNED_16BIT_JUMP_RANGE,
        );

        assert_eq!(block_order, vec![l0, l1, l2]);
        assert_eq!(blocks, before);
    }

    #[test]
    fn oversized_back_goto_becomes_goto_w() {
        let mut generator = crate::code::LabelGenerator::new();
        let l0 = generator.fresh_label();
        let l1 = generator.fresh_label();

        let mut block_order = vec![l0, l1];
        let mut blocks = HashMap::from([
            (l0, dummy_block(2, BranchInstruction::Return)),
            (l1, dummy_block(34000, BranchInstruction::Goto(l0))),
        ]);

        let mut arena = LabelArena::new();
        widen_oversized_jumps(
            &mut block_order,
            &mut blocks,
            &mut arena,
            &SIGNED_16BIT_JUMP_RANGE,
        );

        assert_eq!(block_order, vec![l0, l1]);
        assert!(matches!(
            blocks[&l1].branch_end,
            BranchInstruction::GotoW(target) if target == l0
        ));
        assert_eq!(
            blocks[&l1].instructions.len(),
            34000 + 2,
            "two nops keep the rewrite a multiple of four bytes"
        );
        assert_all_jumps_in_range(&block_order, &blocks);
    }

    #[test]
    fn oversized_conditional_gets_trampoline() {
        let mut generator = crate::code::LabelGenerator::new();
        let l0 = generator.fresh_label();
        let l1 = generator.fresh_label();
        let l2 = generator.fresh_label();

        let mut block_order = vec![l0, l1, l2];
        let mut blocks = HashMap::from([
            (
                l0,
                dummy_block(2, BranchInstruction::If(OrdComparison::EQ, l2, l1)),
            ),
            (l1, dummy_block(34000, BranchInstruction::Return)),
            (l2, dummy_block(2, BranchInstruction::Return)),
        ]);

        let mut arena = LabelArena::new();
        widen_oversized_jumps(
            &mut block_order,
            &mut blocks,
            &mut arena,
            &SIGNED_16BIT_JUMP_RANGE,
        );

        assert_eq!(block_order.len(), 5, "two trampoline blocks were spliced in");
        let near_lbl = block_order[1];
        let far_lbl = block_order[2];
        assert_eq!(&block_order[3..], &[l1, l2]);

        // The branch is inverted and retargeted at the trampolines
        assert_eq!(
            blocks[&l0].branch_end,
            BranchInstruction::If(OrdComparison::NE, far_lbl, near_lbl)
        );
        assert_eq!(blocks[&near_lbl].branch_end, BranchInstruction::Goto(l1));
        assert_eq!(blocks[&far_lbl].branch_end, BranchInstruction::GotoW(l2));
        assert_all_jumps_in_range(&block_order, &blocks);
    }

    #[test]
    fn switch_padding_aligns_operands() {
        let mut generator = crate::code::LabelGenerator::new();
        let l0 = generator.fresh_label();
        let l1 = generator.fresh_label();

        for prefix_len in 0..4 {
            let mut blocks = HashMap::from([
                (
                    l0,
                    dummy_block(
                        prefix_len,
                        BranchInstruction::TableSwitch {
                            padding: 0,
                            default: l1,
                            low: 0,
                            targets: vec![l1, l1],
                        },
                    ),
                ),
                (l1, dummy_block(0, BranchInstruction::Return)),
            ]);
            fix_switch_padding(&[l0, l1], &mut blocks);

            let padding = match &blocks[&l0].branch_end {
                BranchInstruction::TableSwitch { padding, .. } => *padding,
                _ => unreachable!(),
            };
            assert_eq!((prefix_len + 1 + padding as usize) % 4, 0);
        }
    }
}
