#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub use primitive_types::U256;

pub mod arith;
pub mod semantics;

mod instruction;
pub use instruction::{Instruction, InstructionInfo};

mod item;
pub use item::{AssemblyItem, TagId};

// CONSTANTS
// ================================================================================================

/// The maximum number of elements the VM operand stack can hold.
pub const STACK_DEPTH_LIMIT: usize = 1024;

/// The deepest stack element reachable by a single DUP or SWAP instruction.
pub const MAX_SWAP_DEPTH: usize = 16;
