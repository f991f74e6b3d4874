//! Typed bytecode, labels, basic blocks, and layout
//!
//! Method bodies are modelled as a CFG of [`BasicBlock`]s: straight-line
//! [`Instruction`]s closed off by exactly one [`BranchInstruction`]. Blocks
//! are keyed by [`Label`], whose mutable state (offsets, pending patches)
//! lives in a per-method [`LabelArena`].

mod basic_block;
mod instructions;
mod label;
mod layout;
mod refs;

pub use basic_block::*;
pub use instructions::*;
pub use label::*;
pub use layout::*;
pub use refs::*;

use crate::descriptors::RefType;
use crate::names::BinaryName;

/// Instruction with operands in their symbolic (pool-resolved) form, the
/// currency of visitor events
pub type SymbolicInstruction =
    Instruction<RefType<BinaryName>, ConstantData, FieldRef, MethodRef, InvokeDynamicRef>;

/// Branch closing a basic block inside the encoder (fallthrough target is a
/// real block label)
pub type SymbolicBranch = BranchInstruction<Label, Label, Label>;

/// Branch as it appears in visitor events: the fallthrough (if any) is
/// implicit, continuing at whatever the producer emits next
pub type BranchEvent = BranchInstruction<Label, Label, ()>;
