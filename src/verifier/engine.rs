//! Worklist fixed point computing the frame at every basic block entry
//!
//! The algorithm is classic abstract interpretation over the block graph:
//! seed the entry block's frame from the method signature, simulate each
//! block against its entry frame, propagate the exit frame to every
//! successor, and merge where paths meet. A block is re-enqueued whenever a
//! merge changes its entry frame. Termination is guaranteed because the
//! merge lattice only loses information and slot counts are bounded.

use crate::code::{JumpTargets, Label, SymbolicBranch, SymbolicInstruction};
use crate::descriptors::RefType;
use crate::errors::Error;
use crate::hierarchy::ClassHierarchy;
use crate::names::BinaryName;
use crate::util::Offset;
use crate::verifier::{execute, execute_branch, FrameState, InsnContext, VType};
use std::collections::{HashMap, HashSet, VecDeque};

/// One basic block, as the engine wants to see it
///
/// Instruction offsets are the block-relative offsets the instructions will
/// have once serialized (needed to identify `new` allocation sites); they are
/// supplied separately because symbolic instructions don't know their encoded
/// width yet.
pub struct EngineBlock<'a> {
    pub instructions: &'a [SymbolicInstruction],
    pub insn_offsets: &'a [Offset],
    pub branch_end: &'a SymbolicBranch,

    /// Exception handlers covering this block: (handler block, catch type)
    pub handlers: Vec<(Label, RefType<BinaryName>)>,
}

/// Result of the fixed point
pub struct FrameComputation {
    /// Entry frame of every reachable block
    pub block_frames: HashMap<Label, FrameState>,

    /// Blocks the fixed point never reached
    pub dead_blocks: Vec<Label>,

    /// Peak operand stack depth, in slots
    pub max_stack: usize,

    /// Peak local count, in slots
    pub max_locals: usize,
}

/// Run the fixed point over a method's blocks
///
/// `this_class` is needed so `<init>` calls can initialize
/// `UninitializedThis`; the hierarchy resolver is consulted for object-type
/// merges. Failure means no frames can be produced for the method (and no
/// output should be emitted): simulation hit something malformed, a jump
/// targets a label with no block, or a class lookup failed.
pub fn compute_frames(
    block_order: &[Label],
    blocks: &HashMap<Label, EngineBlock<'_>>,
    this_class: &BinaryName,
    entry_frame: FrameState,
    hierarchy: &dyn ClassHierarchy,
) -> Result<FrameComputation, Error> {
    let entry_label = match block_order.first() {
        Some(label) => *label,
        None => {
            return Ok(FrameComputation {
                block_frames: HashMap::new(),
                dead_blocks: vec![],
                max_stack: 0,
                max_locals: entry_frame.locals.len(),
            })
        }
    };

    let mut max_stack = entry_frame.stack_width();
    let mut max_locals = entry_frame.locals.len();

    let mut block_frames: HashMap<Label, FrameState> = HashMap::new();
    block_frames.insert(entry_label, entry_frame);

    let mut worklist: VecDeque<Label> = VecDeque::from([entry_label]);
    let mut enqueued: HashSet<Label> = HashSet::from([entry_label]);

    while let Some(block_label) = worklist.pop_front() {
        enqueued.remove(&block_label);
        let block = blocks
            .get(&block_label)
            .ok_or(Error::UnresolvedLabel(block_label))?;

        // Simulate the block against its entry frame
        let mut frame = block_frames[&block_label].clone();
        for (index, insn) in block.instructions.iter().enumerate() {
            let ctx = InsnContext {
                this_class,
                block: block_label,
                offset_in_block: block.insn_offsets[index],
            };
            execute(insn, &mut frame, &ctx).map_err(|kind| Error::FrameComputation {
                instruction: format!("{:?}", insn),
                kind,
            })?;
            frame.update_maximums(&mut max_locals, &mut max_stack);
        }

        // Handlers covering this block see its locals with the stack reset
        // to just the caught exception
        for (handler_label, catch_type) in &block.handlers {
            let handler_frame = FrameState {
                locals: frame.locals.clone(),
                stack: vec![VType::Object(catch_type.clone())],
            };
            merge_into(
                *handler_label,
                &handler_frame,
                hierarchy,
                &mut block_frames,
                &mut worklist,
                &mut enqueued,
            )?;
        }

        execute_branch(block.branch_end, &mut frame).map_err(|kind| Error::FrameComputation {
            instruction: format!("{:?}", block.branch_end),
            kind,
        })?;

        // Fallthrough and jump targets both see the post-branch frame
        if let Some(fallthrough) = block.branch_end.fallthrough_target() {
            merge_into(
                fallthrough,
                &frame,
                hierarchy,
                &mut block_frames,
                &mut worklist,
                &mut enqueued,
            )?;
        }
        match block.branch_end.jump_targets() {
            JumpTargets::None => (),
            JumpTargets::Regular(target) | JumpTargets::Wide(target) => {
                merge_into(
                    target,
                    &frame,
                    hierarchy,
                    &mut block_frames,
                    &mut worklist,
                    &mut enqueued,
                )?;
            }
            JumpTargets::WideMany(targets) => {
                for target in targets {
                    merge_into(
                        target,
                        &frame,
                        hierarchy,
                        &mut block_frames,
                        &mut worklist,
                        &mut enqueued,
                    )?;
                }
            }
        }
    }

    let dead_blocks: Vec<Label> = block_order
        .iter()
        .filter(|label| !block_frames.contains_key(*label))
        .copied()
        .collect();
    if !dead_blocks.is_empty() {
        log::debug!("{} unreachable basic blocks", dead_blocks.len());
    }

    Ok(FrameComputation {
        block_frames,
        dead_blocks,
        max_stack,
        max_locals,
    })
}

/// Propagate a frame into a successor block, re-enqueueing it if its entry
/// frame changed
fn merge_into(
    target: Label,
    incoming: &FrameState,
    hierarchy: &dyn ClassHierarchy,
    block_frames: &mut HashMap<Label, FrameState>,
    worklist: &mut VecDeque<Label>,
    enqueued: &mut HashSet<Label>,
) -> Result<(), Error> {
    let changed = match block_frames.get_mut(&target) {
        None => {
            block_frames.insert(target, incoming.clone());
            true
        }
        Some(existing) => existing.merge_from(incoming, hierarchy)?,
    };
    if changed && enqueued.insert(target) {
        worklist.push_back(target);
    }
    Ok(())
}
