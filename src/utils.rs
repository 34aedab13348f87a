//! Identifier and human-readable code helpers

use super::error::{Error, Result};
use bech32::Bech32m;
use uuid7::uuid7;

pub const SUBMISSION_HRP: &str = "sub";
pub const ENTRY_HRP: &str = "txn";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| Error::StorageFailure(e.to_string()))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| Error::StorageFailure(e.to_string()))?;
    Ok(encode)
}

/// `<prefix><yyyymmdd><sequence>`, zero-padded to `width` but never truncated.
pub fn daily_code(prefix: &str, day: &str, sequence: u64, width: usize) -> String {
    format!("{prefix}{day}{sequence:0width$}")
}

/// Length-prefixed key component so one user's key range never overlaps another's.
///
/// Scopes longer than `u16::MAX` bytes cannot be prefixed and are rejected.
pub(crate) fn scoped_key(scope: &str) -> Result<Vec<u8>> {
    let bytes = scope.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::InvalidReference(format!("id of {} bytes is too long", bytes.len())))?;
    let mut key = Vec::with_capacity(bytes.len() + 2);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    Ok(key)
}
