//! Sled trees backing the core and the plumbing shared by every transaction
use super::error::{Error, Result};
use super::types::TimeStamp;
use super::utils::daily_code;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use std::sync::Arc;
use tracing::warn;

/// How many fresh codes a write may try before giving up.
pub(crate) const CODE_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
    pub(crate) submissions: sled::Tree,
    pub(crate) submission_codes: sled::Tree,
    pub(crate) user_submissions: sled::Tree,
    pub(crate) entries: sled::Tree,
    pub(crate) heads: sled::Tree,
    pub(crate) entry_index: sled::Tree,
    pub(crate) entry_codes: sled::Tree,
    pub(crate) bank_ratings: sled::Tree,
    sequences: sled::Tree,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            submissions: instance.open_tree("submissions")?,
            submission_codes: instance.open_tree("submission_codes")?,
            user_submissions: instance.open_tree("user_submissions")?,
            entries: instance.open_tree("ledger_entries")?,
            heads: instance.open_tree("ledger_heads")?,
            entry_index: instance.open_tree("ledger_index")?,
            entry_codes: instance.open_tree("ledger_codes")?,
            bank_ratings: instance.open_tree("bank_ratings")?,
            sequences: instance.open_tree("sequences")?,
            instance,
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn instance(&self) -> &Arc<sled::Db> {
        &self.instance
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.instance.flush()?)
    }

    /// Next code of the form `<prefix><yyyymmdd><sequence>` for today.
    ///
    /// The counter is bumped with an atomic compare-and-swap, so concurrent
    /// callers never see the same value and no lock is held.
    pub(crate) fn next_code(&self, prefix: &str, width: usize) -> Result<String> {
        let day = TimeStamp::new().day_stamp();
        let key = format!("{prefix}{day}");
        let bumped = self.sequences.update_and_fetch(key.as_bytes(), |old| {
            let current = old
                .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            Some(current.saturating_add(1).to_be_bytes().to_vec())
        })?;
        let sequence = bumped
            .and_then(|raw| <[u8; 8]>::try_from(raw.as_ref()).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| Error::StorageFailure(format!("sequence {key} is unreadable")))?;

        Ok(daily_code(prefix, &day, sequence, width))
    }
}

/// Why a transaction closure gave up.
#[derive(Debug)]
pub(crate) enum Abort {
    Rejected(Error),
    /// The reserved human-readable code already exists; retry with a new one.
    CodeTaken,
}

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, Abort>;

pub(crate) fn abort(err: Error) -> ConflictableTransactionError<Abort> {
    ConflictableTransactionError::Abort(Abort::Rejected(err))
}

pub(crate) fn code_taken() -> ConflictableTransactionError<Abort> {
    ConflictableTransactionError::Abort(Abort::CodeTaken)
}

pub(crate) fn decode_tx<T>(raw: &[u8]) -> TxResult<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(raw).map_err(|e| abort(e.into()))
}

pub(crate) fn encode_tx<T: minicbor::Encode<()>>(value: &T) -> TxResult<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| abort(e.into()))
}

/// Error of a transaction that never reserves a code.
pub(crate) fn flatten(err: TransactionError<Abort>) -> Error {
    match err {
        TransactionError::Abort(Abort::Rejected(err)) => err,
        TransactionError::Abort(Abort::CodeTaken) => Error::Conflict("unexpected code collision".into()),
        TransactionError::Storage(err) => err.into(),
    }
}

/// Collapse a finished transaction. `Ok(None)` asks the caller to retry with a fresh code.
pub(crate) fn finish<T>(result: Result<T, TransactionError<Abort>>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(TransactionError::Abort(Abort::CodeTaken)) => Ok(None),
        Err(TransactionError::Abort(Abort::Rejected(err))) => Err(err),
        Err(TransactionError::Storage(err)) => Err(err.into()),
    }
}

/// Run `attempt` until it commits, fails, or runs out of fresh codes.
pub(crate) fn with_code_retries<T>(what: &str, mut attempt: impl FnMut() -> Result<Option<T>>) -> Result<T> {
    for round in 1..=CODE_ATTEMPTS {
        if let Some(value) = attempt()? {
            return Ok(value);
        }
        warn!(what, round, "generated code already in use, retrying");
    }
    Err(Error::Conflict(format!("could not allocate a unique {what} code")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_increase_within_a_day() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Store::new(Arc::new(db)).unwrap();

        let first = store.next_code("SUB", 4).unwrap();
        let second = store.next_code("SUB", 4).unwrap();
        let other = store.next_code("TXN", 6).unwrap();

        assert!(first.starts_with("SUB") && first.ends_with("0001"));
        assert!(second.ends_with("0002"));
        assert!(other.starts_with("TXN") && other.ends_with("000001"));
    }

    #[test]
    fn retries_stop_after_budget() {
        let mut calls = 0;
        let result: Result<()> = with_code_retries("test", || {
            calls += 1;
            Ok(None)
        });

        assert_eq!(calls, CODE_ATTEMPTS);
        assert_eq!(result.unwrap_err().code(), "conflict");
    }
}
