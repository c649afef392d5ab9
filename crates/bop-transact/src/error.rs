use std::fmt::{Display, Formatter};

/// Coarse classification of a [`TransactError`].
///
/// Callers branch on the kind rather than on individual variants: a retryable
/// failure means the whole transaction should be restarted from scratch, while a
/// fatal failure means the store (or the structure being read) can no longer be
/// trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Retryable,
    Duplicate,
    NotFound,
    Invalid,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the transactional store.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TransactError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A path or resource id is already claimed by another in-flight transaction.
    #[error("transaction conflict: {0}")]
    Conflict(String),
    /// The path or resource id already exists in the transaction's view.
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// The path or resource id does not exist at the requested revision.
    #[error("not found: {0}")]
    NotFound(String),
    /// The caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A compiled program does not fit in its journal slot.
    #[error("transaction buffer overflow: required {required} bytes, capacity {capacity}")]
    BufferOverflow { required: usize, capacity: usize },
    /// A ring buffer has no free slot left until the collector trims it.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),
    /// A persisted structure failed validation.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// A transaction program could not be decoded.
    #[error("program corruption: {0}")]
    ProgramCorruption(String),
    /// An internal consistency check failed.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl TransactError {
    pub fn conflict<T: Display>(msg: T) -> Self {
        Self::Conflict(msg.to_string())
    }

    pub fn duplicate<T: Display>(msg: T) -> Self {
        Self::Duplicate(msg.to_string())
    }

    pub fn not_found<T: Display>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn invalid_argument<T: Display>(msg: T) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    pub fn corruption<T: Display>(msg: T) -> Self {
        Self::Corruption(msg.to_string())
    }

    pub fn program_corruption<T: Display>(msg: T) -> Self {
        Self::ProgramCorruption(msg.to_string())
    }

    pub fn fatal<T: Display>(msg: T) -> Self {
        Self::Fatal(msg.to_string())
    }

    pub fn invalid_config<T: Display>(msg: T) -> Self {
        Self::InvalidConfig(msg.to_string())
    }

    pub fn invalid_state<T: Display>(msg: T) -> Self {
        Self::InvalidState(msg.to_string())
    }

    pub fn exhausted<T: Display>(msg: T) -> Self {
        Self::CapacityExhausted(msg.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactError::Conflict(_) | TransactError::CapacityExhausted(_) => {
                ErrorKind::Retryable
            }
            TransactError::Duplicate(_) => ErrorKind::Duplicate,
            TransactError::NotFound(_) => ErrorKind::NotFound,
            TransactError::InvalidArgument(_)
            | TransactError::BufferOverflow { .. }
            | TransactError::InvalidConfig(_)
            | TransactError::InvalidState(_) => ErrorKind::Invalid,
            TransactError::Io(_)
            | TransactError::Corruption(_)
            | TransactError::ProgramCorruption(_)
            | TransactError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// A Result type alias for store operations.
pub type TransactResult<T> = Result<T, TransactError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_retryable() {
        let err = TransactError::conflict("/a/b");
        assert!(err.is_retryable());
        assert_eq!(err.kind().as_str(), "retryable");
        assert!(matches!(err, TransactError::Conflict(msg) if msg == "/a/b"));
    }

    #[test]
    fn io_errors_are_fatal() {
        let err = TransactError::from(std::io::Error::other("disk gone"));
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "I/O error: disk gone");
    }

    #[test]
    fn overflow_reports_sizes() {
        let err = TransactError::BufferOverflow {
            required: 9000,
            capacity: 8192,
        };
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(
            err.to_string(),
            "transaction buffer overflow: required 9000 bytes, capacity 8192"
        );
    }
}
