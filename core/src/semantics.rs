//! Context-independent predicates over assembly items.
//!
//! These helpers classify items without reference to surrounding code: whether an item terminates
//! a basic block, whether its operands commute, and how it interacts with storage and memory. The
//! optimizer drives all of its scheduling decisions off these tables.

use crate::{AssemblyItem, Instruction};

/// Returns true if the given item starts or ends a basic block.
///
/// Control-flow operations and tag definitions are block boundaries; the optimizer never looks
/// across them.
pub fn breaks_basic_block(item: &AssemblyItem) -> bool {
    use Instruction::*;
    match item {
        AssemblyItem::Tag(_) => true,
        AssemblyItem::Push(_) | AssemblyItem::PushTag(_) => false,
        AssemblyItem::Op(inst) => {
            matches!(inst, Stop | Jump | JumpI | JumpDest | Return | SelfDestruct | Invalid)
        },
    }
}

/// Returns true if the item is a two-argument operation whose value does not depend on the order
/// of its arguments.
pub fn is_commutative(item: &AssemblyItem) -> bool {
    use Instruction::*;
    matches!(item, AssemblyItem::Op(Add | Mul | Eq | And | Or | Xor))
}

/// Returns true if the item is a DUP instruction.
pub fn is_dup(item: &AssemblyItem) -> bool {
    matches!(item, AssemblyItem::Op(Instruction::Dup(_)))
}

/// Returns true if the item is a SWAP instruction.
pub fn is_swap(item: &AssemblyItem) -> bool {
    matches!(item, AssemblyItem::Op(Instruction::Swap(_)))
}

/// Returns true if the item reads or writes contract storage.
pub fn accesses_storage(item: &AssemblyItem) -> bool {
    matches!(item, AssemblyItem::Op(Instruction::SLoad | Instruction::SStore))
}

/// Returns true if the item reads or writes VM memory.
pub fn accesses_memory(item: &AssemblyItem) -> bool {
    matches!(item, AssemblyItem::Op(Instruction::MLoad | Instruction::MStore))
}

/// Returns true if the item is a modeled load (SLOAD or MLOAD).
pub fn is_load(item: &AssemblyItem) -> bool {
    matches!(item, AssemblyItem::Op(Instruction::SLoad | Instruction::MLoad))
}

/// Returns true if the item is a modeled store (SSTORE or MSTORE).
pub fn is_store(item: &AssemblyItem) -> bool {
    matches!(item, AssemblyItem::Op(Instruction::SStore | Instruction::MStore))
}

/// Returns true if the item's result depends only on its stack arguments.
///
/// Pure items can be recomputed freely and are subject to common subexpression elimination.
/// Everything touching the environment, memory, storage, or external state is impure; so are the
/// structural stack items, which are not value computations at all.
pub fn is_pure(item: &AssemblyItem) -> bool {
    use Instruction::*;
    match item {
        AssemblyItem::Push(_) | AssemblyItem::PushTag(_) => true,
        AssemblyItem::Tag(_) => false,
        AssemblyItem::Op(inst) => matches!(
            inst,
            Add | Mul
                | Sub
                | Div
                | Sdiv
                | Mod
                | Smod
                | AddMod
                | MulMod
                | Exp
                | Not
                | Lt
                | Gt
                | Slt
                | Sgt
                | Eq
                | IsZero
                | And
                | Or
                | Xor
                | Byte
        ),
    }
}

/// Returns true if executing the item has an effect observable beyond its stack result.
///
/// SSTORE and MSTORE are excluded: the optimizer models those precisely through its store log.
pub fn has_side_effects(item: &AssemblyItem) -> bool {
    use Instruction::*;
    matches!(
        item,
        AssemblyItem::Op(Create | Call | CallCode | Log(_) | CallDataCopy | CodeCopy)
    )
}

// TESTS
// ================================================================================================
