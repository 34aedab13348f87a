//! Error kinds surfaced by the marketplace core
use super::submission::SubmissionStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0} does not exist or is not active")]
    InvalidReference(String),
    #[error("Weight {0} is outside the accepted bounds")]
    InvalidWeight(String),
    #[error("Amount {0} is not acceptable for this operation")]
    InvalidAmount(String),
    #[error("Submission cannot move from {from} to {to}")]
    IllegalTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    #[error("User {0} is not allowed to act on this submission")]
    Forbidden(String),
    #[error("Only completed submissions can be rated, current status is {0}")]
    NotRatable(SubmissionStatus),
    #[error("Submission has already been rated")]
    AlreadyRated,
    #[error("Rating {0} must be between 1 and 5")]
    InvalidRating(u8),
    #[error("Balance {balance} is lower than the requested {requested}")]
    InsufficientBalance { balance: String, requested: String },
    #[error("Stale write rejected: {0}")]
    Conflict(String),
    #[error("Storage failure: {0}")]
    StorageFailure(String),
    #[error("Submission {0} was not found")]
    SubmissionNotFound(String),
    #[error("Ledger entry {0} was not found")]
    EntryNotFound(String),
    #[error("At most {max} photos are accepted, got {got}")]
    TooManyPhotos { max: usize, got: usize },
    #[error("Pickup details are incomplete: {0}")]
    InvalidPickup(String),
    #[error("Ledger for {user} is inconsistent at sequence {sequence}: {reason}")]
    LedgerCorrupted {
        user: String,
        sequence: u64,
        reason: String,
    },
}

impl Error {
    /// Stable machine-readable code, safe to hand to transports.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidReference(_) => "invalid_reference",
            Error::InvalidWeight(_) => "invalid_weight",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::IllegalTransition { .. } => "illegal_transition",
            Error::Forbidden(_) => "forbidden",
            Error::NotRatable(_) => "not_ratable",
            Error::AlreadyRated => "already_rated",
            Error::InvalidRating(_) => "invalid_rating",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::Conflict(_) => "conflict",
            Error::StorageFailure(_) => "storage_failure",
            Error::SubmissionNotFound(_) => "submission_not_found",
            Error::EntryNotFound(_) => "entry_not_found",
            Error::TooManyPhotos { .. } => "too_many_photos",
            Error::InvalidPickup(_) => "invalid_pickup",
            Error::LedgerCorrupted { .. } => "ledger_corrupted",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageFailure(_) | Error::Conflict(_))
    }
}

impl From<sled::Error> for Error {
    fn from(value: sled::Error) -> Self {
        Error::StorageFailure(value.to_string())
    }
}

impl From<minicbor::decode::Error> for Error {
    fn from(value: minicbor::decode::Error) -> Self {
        Error::StorageFailure(format!("corrupt record: {value}"))
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for Error {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        Error::StorageFailure(format!("failed to encode record: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::AlreadyRated.code(), "already_rated");
        assert_eq!(
            Error::IllegalTransition {
                from: SubmissionStatus::Completed,
                to: SubmissionStatus::Completed,
            }
            .code(),
            "illegal_transition"
        );
        assert_eq!(
            Error::InsufficientBalance {
                balance: "0".into(),
                requested: "1".into(),
            }
            .code(),
            "insufficient_balance"
        );
    }

    #[test]
    fn only_storage_and_conflict_are_retryable() {
        assert!(Error::StorageFailure("io".into()).is_retryable());
        assert!(Error::Conflict("version".into()).is_retryable());
        assert!(!Error::AlreadyRated.is_retryable());
        assert!(!Error::InvalidRating(9).is_retryable());
    }
}
