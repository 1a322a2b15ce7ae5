use core::fmt;

use primitive_types::U256;

use crate::Instruction;

// TAG ID
// ================================================================================================

/// Identifier of a jump tag within an assembly unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagId(u32);

impl TagId {
    /// Returns a new [`TagId`] with the specified value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric value of this tag id.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag_{}", self.0)
    }
}

// ASSEMBLY ITEM
// ================================================================================================

/// A single element of an assembly stream.
///
/// Besides concrete VM operations, an assembly stream contains synthetic items which are resolved
/// at link time: push constants of the full 256-bit word width, tag definitions, and pushes of a
/// tag's eventual code offset.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssemblyItem {
    /// A concrete VM operation.
    Op(Instruction),
    /// Pushes a 256-bit constant onto the stack.
    Push(U256),
    /// Defines a jump destination; lowered to `JUMPDEST` with a known code offset.
    Tag(TagId),
    /// Pushes the code offset of a tag onto the stack.
    PushTag(TagId),
}

impl AssemblyItem {
    /// Returns a push item for the specified value.
    pub fn push(value: u64) -> Self {
        Self::Push(U256::from(value))
    }

    /// Returns the instruction of this item, if it is a concrete operation.
    pub fn instruction(&self) -> Option<Instruction> {
        match self {
            Self::Op(inst) => Some(*inst),
            _ => None,
        }
    }

    /// Returns the number of stack elements this item consumes.
    pub fn args(&self) -> usize {
        match self {
            Self::Op(inst) => inst.info().args,
            Self::Push(_) | Self::Tag(_) | Self::PushTag(_) => 0,
        }
    }

    /// Returns the number of stack elements on the stack after this item, counting the consumed
    /// ones.
    pub fn out(&self) -> usize {
        match self {
            Self::Op(inst) => inst.info().out,
            Self::Push(_) | Self::PushTag(_) => 1,
            Self::Tag(_) => 0,
        }
    }

    /// Returns the net stack height change caused by executing this item.
    pub fn deposit(&self) -> isize {
        self.out() as isize - self.args() as isize
    }
}

impl From<Instruction> for AssemblyItem {
    fn from(inst: Instruction) -> Self {
        Self::Op(inst)
    }
}

impl fmt::Display for AssemblyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Op(inst) => write!(f, "{inst}"),
            Self::Push(value) => write!(f, "PUSH {value:#x}"),
            Self::Tag(tag) => write!(f, "{tag}"),
            Self::PushTag(tag) => write!(f, "PUSH[{tag}]"),
        }
    }
}

// TESTS
// ================================================================================================
