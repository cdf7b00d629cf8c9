//! Error taxonomy surfaced by the organizers.

use keeld_chainstate::ChainError;
use keeld_pow::validation::PowError;
use keeld_script::ScriptError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Component has shut down.
    ServiceStopped,
    /// Block already in the pool or the store.
    DuplicateBlock,
    /// Branch root has no known on-chain parent.
    OrphanBlock,
    /// Branch does not exceed the current tip's cumulative work.
    InsufficientWork,
    InvalidHeader(&'static str),
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
    InvalidScript(&'static str),
    /// Query target absent.
    NotFound,
    /// The store could not satisfy a precondition.
    OperationFailed,
    /// A reorganization failed midway and could not be rolled back.
    StoreCorrupted,
    NotImplemented,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ServiceStopped => write!(f, "service stopped"),
            Error::DuplicateBlock => write!(f, "duplicate block"),
            Error::OrphanBlock => write!(f, "orphan block"),
            Error::InsufficientWork => write!(f, "insufficient work"),
            Error::InvalidHeader(reason) => write!(f, "invalid header: {reason}"),
            Error::InvalidBlock(reason) => write!(f, "invalid block: {reason}"),
            Error::InvalidTransaction(reason) => write!(f, "invalid transaction: {reason}"),
            Error::InvalidScript(reason) => write!(f, "invalid script: {reason}"),
            Error::NotFound => write!(f, "not found"),
            Error::OperationFailed => write!(f, "operation failed"),
            Error::StoreCorrupted => write!(f, "store corrupted"),
            Error::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ChainError> for Error {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::NotFound => Error::NotFound,
            ChainError::Corrupted => Error::StoreCorrupted,
            ChainError::Stopped => Error::ServiceStopped,
            ChainError::Store(_) | ChainError::Codec(_) | ChainError::OperationFailed(_) => {
                Error::OperationFailed
            }
        }
    }
}

impl From<PowError> for Error {
    fn from(err: PowError) -> Self {
        match err {
            PowError::Compact(_) => Error::InvalidHeader("malformed compact target"),
            PowError::TargetAboveLimit => Error::InvalidHeader("target above proof-of-work limit"),
            PowError::HashAboveTarget => Error::InvalidHeader("insufficient proof of work"),
        }
    }
}

impl From<ScriptError> for Error {
    fn from(err: ScriptError) -> Self {
        Error::InvalidScript(script_reason(err))
    }
}

pub(crate) fn script_reason(err: ScriptError) -> &'static str {
    match err {
        ScriptError::MalformedPush => "malformed push",
        ScriptError::UnsupportedOpcode(_) => "unsupported opcode",
        ScriptError::StackUnderflow => "stack underflow",
        ScriptError::StackOverflow => "stack overflow",
        ScriptError::ElementTooLarge => "stack element too large",
        ScriptError::ReturnEncountered => "unspendable output",
        ScriptError::VerifyFailed => "verify failed",
        ScriptError::EvalFalse => "evaluated false",
        ScriptError::DirtyStack => "clean stack violation",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_errors_collapse_to_kinds() {
        assert_eq!(Error::from(ChainError::NotFound), Error::NotFound);
        assert_eq!(Error::from(ChainError::Corrupted), Error::StoreCorrupted);
        assert_eq!(Error::from(ChainError::Stopped), Error::ServiceStopped);
        assert_eq!(
            Error::from(ChainError::OperationFailed("x")),
            Error::OperationFailed
        );
    }
}
