use basalt_core::STACK_DEPTH_LIMIT;

// OPTIMIZER ERROR
// ================================================================================================

/// Errors raised while optimizing a basic block.
///
/// `StackUnderflow` indicates malformed input and is surfaced to the caller. The other variants
/// abort the optimization of the current block only; the caller is expected to fall back to
/// emitting the original items unchanged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OptimizerError {
    #[error(
        "item at block offset {offset} reaches more than {STACK_DEPTH_LIMIT} elements below the \
         stack at block entry"
    )]
    StackUnderflow { offset: usize },
    #[error("stack element at depth {depth} is out of reach for a single DUP or SWAP")]
    StackTooDeep { depth: usize },
    #[error("internal invariant violated: {reason}")]
    Internal { reason: &'static str },
}

impl OptimizerError {
    pub(crate) const fn internal(reason: &'static str) -> Self {
        Self::Internal { reason }
    }
}
