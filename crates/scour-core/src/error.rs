use thiserror::Error;

/// Error taxonomy of the checker. The kinds map one-to-one onto the caller
/// behaviours: transient errors are retried with back-off, `NotApplicable`
/// is silently dropped by the receiver, logical errors surface verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("out of group")]
    OutOfGroup,

    #[error("group version mismatch")]
    GroupVersion,

    #[error("try again")]
    Again,

    #[error("timed out")]
    TimedOut,

    /// The message belongs to another instance generation; drop it.
    #[error("not applicable")]
    NotApplicable,

    #[error("not the check leader")]
    NotLeader,

    #[error("stale: {0}")]
    Stale(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no handle")]
    NoHandle,

    /// An instance is already starting or the scheduler is exiting.
    #[error("busy")]
    Busy,

    /// A stop is in flight.
    #[error("in progress")]
    InProgress,

    /// The requested state is already in effect.
    #[error("already done")]
    Already,

    /// The rank was evicted; the caller must not retry.
    #[error("no permission")]
    NoPerm,

    #[error("shut down")]
    Shutdown,

    /// Local persistent state is unusable (magic mismatch, torn write).
    #[error("io: {0}")]
    Io(String),

    /// A blocking interaction was cancelled by stop/pause.
    #[error("interrupted")]
    Interrupted,

    #[error("internal: {0}")]
    Internal(String),
}

impl CheckError {
    /// Transient transport errors: retry with 1 s back-off until pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OutOfGroup | Self::GroupVersion | Self::Again | Self::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(CheckError::OutOfGroup.is_transient());
        assert!(CheckError::Again.is_transient());
        assert!(CheckError::TimedOut.is_transient());
        assert!(!CheckError::NotApplicable.is_transient());
        assert!(!CheckError::Busy.is_transient());
        assert!(!CheckError::Io("magic".into()).is_transient());
    }
}
