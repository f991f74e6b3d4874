//! Verification types, frames, and the frame inference engine
//!
//! Computing `StackMapTable` frames is an abstract interpretation of the
//! method body: [`interpreter`] knows the stack effect of every opcode,
//! [`FrameState`] holds the abstract state and its merge lattice, and
//! [`engine`] drives the worklist fixed point over the basic block graph.

mod engine;
mod frame;
mod interpreter;
mod types;

pub use engine::*;
pub use frame::*;
pub use interpreter::*;
pub use types::*;
