use core::fmt;

// INSTRUCTION
// ================================================================================================

/// An opcode of the Basalt VM.
///
/// Each instruction pops a fixed number of arguments off the operand stack and pushes a fixed
/// number of results; the arities are available via [`Instruction::info`]. `Dup`, `Swap` and
/// `Log` carry their index as an immediate part of the opcode (`DUP1..DUP16`, `SWAP1..SWAP16`,
/// `LOG0..LOG4`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Instruction {
    /// Halts execution.
    Stop,
    /// Addition modulo 2^256.
    Add,
    /// Multiplication modulo 2^256.
    Mul,
    /// Subtraction modulo 2^256.
    Sub,
    /// Integer division; division by zero yields zero.
    Div,
    /// Signed integer division (two's complement).
    Sdiv,
    /// Modulo remainder; modulo zero yields zero.
    Mod,
    /// Signed modulo remainder (sign follows the dividend).
    Smod,
    /// (a + b) % m with arbitrary intermediate precision.
    AddMod,
    /// (a * b) % m with arbitrary intermediate precision.
    MulMod,
    /// Exponentiation modulo 2^256.
    Exp,
    /// Bitwise negation.
    Not,
    /// Unsigned less-than comparison.
    Lt,
    /// Unsigned greater-than comparison.
    Gt,
    /// Signed less-than comparison.
    Slt,
    /// Signed greater-than comparison.
    Sgt,
    /// Equality comparison.
    Eq,
    /// Is-zero test.
    IsZero,
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
    /// Retrieves a single byte from a word (big-endian index).
    Byte,
    /// Keccak-256 hash of a memory range.
    Sha3,
    /// Address of the executing contract.
    Address,
    /// Balance of the given account.
    Balance,
    /// Transaction origin address.
    Origin,
    /// Immediate caller address.
    Caller,
    /// Value transferred with the call.
    CallValue,
    /// Reads a word from call data.
    CallDataLoad,
    /// Size of the call data.
    CallDataSize,
    /// Copies call data into memory.
    CallDataCopy,
    /// Size of the executing contract's code.
    CodeSize,
    /// Copies the executing contract's code into memory.
    CodeCopy,
    /// Gas price of the transaction.
    GasPrice,
    /// Code size of the given account.
    ExtCodeSize,
    /// Hash of one of the most recent blocks.
    BlockHash,
    /// Current block's beneficiary address.
    Coinbase,
    /// Current block's timestamp.
    Timestamp,
    /// Current block's number.
    Number,
    /// Current block's gas limit.
    GasLimit,
    /// Removes the top stack element.
    Pop,
    /// Reads a word from memory.
    MLoad,
    /// Writes a word to memory.
    MStore,
    /// Reads a word from storage.
    SLoad,
    /// Writes a word to storage.
    SStore,
    /// Unconditional jump.
    Jump,
    /// Conditional jump.
    JumpI,
    /// Program counter of this instruction.
    Pc,
    /// Size of active memory.
    MSize,
    /// Remaining gas.
    Gas,
    /// Marks a valid jump destination.
    JumpDest,
    /// Duplicates the n-th stack element (1-based from the top) to the top.
    Dup(u8),
    /// Exchanges the top stack element with the element n positions below it.
    Swap(u8),
    /// Appends a log record with n topics.
    Log(u8),
    /// Creates a new contract.
    Create,
    /// Message-call into an account.
    Call,
    /// Message-call with the caller's code context.
    CallCode,
    /// Halts execution returning a memory range.
    Return,
    /// Halts execution and schedules the contract for destruction.
    SelfDestruct,
    /// Designated invalid instruction.
    Invalid,
}

/// Stack arities of an [`Instruction`]: the number of elements read off the stack and the number
/// of elements on the stack after execution, counting the read elements. Following the VM's
/// instruction tables, `DUP1` is `(1, 2)` and `SWAP1` is `(2, 2)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstructionInfo {
    pub args: usize,
    pub out: usize,
}

impl InstructionInfo {
    const fn new(args: usize, out: usize) -> Self {
        Self { args, out }
    }
}

impl Instruction {
    /// Returns the stack arities of this instruction.
    pub fn info(&self) -> InstructionInfo {
        use Instruction::*;
        match *self {
            Stop => InstructionInfo::new(0, 0),
            Add | Mul | Sub | Div | Sdiv | Mod | Smod | Exp => InstructionInfo::new(2, 1),
            AddMod | MulMod => InstructionInfo::new(3, 1),
            Not | IsZero => InstructionInfo::new(1, 1),
            Lt | Gt | Slt | Sgt | Eq | And | Or | Xor | Byte => InstructionInfo::new(2, 1),
            Sha3 => InstructionInfo::new(2, 1),
            Address | Origin | Caller | CallValue | CallDataSize | CodeSize | GasPrice
            | Coinbase | Timestamp | Number | GasLimit | Pc | MSize | Gas => {
                InstructionInfo::new(0, 1)
            },
            Balance | ExtCodeSize | BlockHash | CallDataLoad => InstructionInfo::new(1, 1),
            CallDataCopy | CodeCopy => InstructionInfo::new(3, 0),
            Pop => InstructionInfo::new(1, 0),
            MLoad | SLoad => InstructionInfo::new(1, 1),
            MStore | SStore => InstructionInfo::new(2, 0),
            Jump => InstructionInfo::new(1, 0),
            JumpI => InstructionInfo::new(2, 0),
            JumpDest => InstructionInfo::new(0, 0),
            Dup(n) => InstructionInfo::new(n as usize, n as usize + 1),
            Swap(n) => InstructionInfo::new(n as usize + 1, n as usize + 1),
            Log(n) => InstructionInfo::new(n as usize + 2, 0),
            Create => InstructionInfo::new(3, 1),
            Call | CallCode => InstructionInfo::new(7, 1),
            Return => InstructionInfo::new(2, 0),
            SelfDestruct => InstructionInfo::new(1, 0),
            Invalid => InstructionInfo::new(0, 0),
        }
    }

}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match *self {
            Stop => write!(f, "STOP"),
            Add => write!(f, "ADD"),
            Mul => write!(f, "MUL"),
            Sub => write!(f, "SUB"),
            Div => write!(f, "DIV"),
            Sdiv => write!(f, "SDIV"),
            Mod => write!(f, "MOD"),
            Smod => write!(f, "SMOD"),
            AddMod => write!(f, "ADDMOD"),
            MulMod => write!(f, "MULMOD"),
            Exp => write!(f, "EXP"),
            Not => write!(f, "NOT"),
            Lt => write!(f, "LT"),
            Gt => write!(f, "GT"),
            Slt => write!(f, "SLT"),
            Sgt => write!(f, "SGT"),
            Eq => write!(f, "EQ"),
            IsZero => write!(f, "ISZERO"),
            And => write!(f, "AND"),
            Or => write!(f, "OR"),
            Xor => write!(f, "XOR"),
            Byte => write!(f, "BYTE"),
            Sha3 => write!(f, "SHA3"),
            Address => write!(f, "ADDRESS"),
            Balance => write!(f, "BALANCE"),
            Origin => write!(f, "ORIGIN"),
            Caller => write!(f, "CALLER"),
            CallValue => write!(f, "CALLVALUE"),
            CallDataLoad => write!(f, "CALLDATALOAD"),
            CallDataSize => write!(f, "CALLDATASIZE"),
            CallDataCopy => write!(f, "CALLDATACOPY"),
            CodeSize => write!(f, "CODESIZE"),
            CodeCopy => write!(f, "CODECOPY"),
            GasPrice => write!(f, "GASPRICE"),
            ExtCodeSize => write!(f, "EXTCODESIZE"),
            BlockHash => write!(f, "BLOCKHASH"),
            Coinbase => write!(f, "COINBASE"),
            Timestamp => write!(f, "TIMESTAMP"),
            Number => write!(f, "NUMBER"),
            GasLimit => write!(f, "GASLIMIT"),
            Pop => write!(f, "POP"),
            MLoad => write!(f, "MLOAD"),
            MStore => write!(f, "MSTORE"),
            SLoad => write!(f, "SLOAD"),
            SStore => write!(f, "SSTORE"),
            Jump => write!(f, "JUMP"),
            JumpI => write!(f, "JUMPI"),
            Pc => write!(f, "PC"),
            MSize => write!(f, "MSIZE"),
            Gas => write!(f, "GAS"),
            JumpDest => write!(f, "JUMPDEST"),
            Dup(n) => write!(f, "DUP{n}"),
            Swap(n) => write!(f, "SWAP{n}"),
            Log(n) => write!(f, "LOG{n}"),
            Create => write!(f, "CREATE"),
            Call => write!(f, "CALL"),
            CallCode => write!(f, "CALLCODE"),
            Return => write!(f, "RETURN"),
            SelfDestruct => write!(f, "SELFDESTRUCT"),
            Invalid => write!(f, "INVALID"),
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Instruction::Add, 2, 1)]
    #[case(Instruction::AddMod, 3, 1)]
    #[case(Instruction::IsZero, 1, 1)]
    #[case(Instruction::Pop, 1, 0)]
    #[case(Instruction::SStore, 2, 0)]
    #[case(Instruction::SLoad, 1, 1)]
    #[case(Instruction::Call, 7, 1)]
    #[case(Instruction::Log(0), 2, 0)]
    #[case(Instruction::Log(4), 6, 0)]
    #[case(Instruction::Timestamp, 0, 1)]
    fn instruction_arities(#[case] inst: Instruction, #[case] args: usize, #[case] out: usize) {
        assert_eq!(inst.info(), InstructionInfo::new(args, out));
    }

    #[test]
    fn dup_swap_arities_follow_index() {
        for n in 1..=16u8 {
            assert_eq!(Instruction::Dup(n).info(), InstructionInfo::new(n as usize, n as usize + 1));
            assert_eq!(
                Instruction::Swap(n).info(),
                InstructionInfo::new(n as usize + 1, n as usize + 1)
            );
        }
    }

    #[test]
    fn display_carries_index() {
        assert_eq!(format!("{}", Instruction::Dup(3)), "DUP3");
        assert_eq!(format!("{}", Instruction::Swap(16)), "SWAP16");
        assert_eq!(format!("{}", Instruction::Log(2)), "LOG2");
        assert_eq!(format!("{}", Instruction::SStore), "SSTORE");
    }
}
