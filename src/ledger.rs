//! Append-only balance ledger and the per-user head that projects the current balance.
//!
//! Every entry for a user lives under that user's key prefix, ordered by a
//! gap-free sequence number. The head record (last sequence, balance, digest)
//! is rewritten in the same sled transaction as each entry insert, so the two
//! are never observed apart. Two writers on the same user conflict on the head
//! key and one of them is retried by sled; writers on different users touch
//! disjoint keys.
use super::config::Settings;
use super::error::{Error, Result};
use super::store::{Store, TxResult, abort, code_taken, decode_tx, encode_tx, finish, with_code_retries};
use super::types::{Fixed, TimeStamp};
use super::utils::{ENTRY_HRP, new_uuid_to_bech32, scoped_key};
use rust_decimal::Decimal;
use sled::Transactional;
use sled::transaction::TransactionalTree;
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Rev;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum EntryKind {
    #[n(0)]
    Credit,
    #[n(1)]
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum Category {
    #[n(0)]
    WasteSale,
    #[n(1)]
    Withdrawal,
    #[n(2)]
    Bonus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum EntryStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Completed,
    #[n(2)]
    Failed,
    #[n(3)]
    Cancelled,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub user_id: String,
    #[n(3)]
    pub sequence: u64, // 1-based, per user
    #[n(4)]
    pub submission_id: Option<String>,
    #[n(5)]
    pub kind: EntryKind,
    #[n(6)]
    pub amount: Fixed,
    #[n(7)]
    pub balance_before: Fixed,
    #[n(8)]
    pub balance_after: Fixed,
    #[n(9)]
    pub category: Category,
    #[n(10)]
    pub status: EntryStatus,
    #[n(11)]
    pub description: Option<String>,
    #[n(12)]
    pub metadata: Metadata,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub prev_digest: Option<String>,
    #[n(15)]
    pub digest: String,
}

// Everything but `status` and `digest`: the fields an entry may never change.
#[derive(minicbor::Encode)]
struct Sealed<'a> {
    #[n(0)]
    id: &'a str,
    #[n(1)]
    code: &'a str,
    #[n(2)]
    user_id: &'a str,
    #[n(3)]
    sequence: u64,
    #[n(4)]
    submission_id: Option<&'a str>,
    #[n(5)]
    kind: EntryKind,
    #[n(6)]
    amount: Fixed,
    #[n(7)]
    balance_before: Fixed,
    #[n(8)]
    balance_after: Fixed,
    #[n(9)]
    category: Category,
    #[n(10)]
    description: Option<&'a str>,
    #[n(11)]
    metadata: &'a Metadata,
    #[n(12)]
    created_at: &'a TimeStamp,
    #[n(13)]
    prev_digest: Option<&'a str>,
}

impl LedgerEntry {
    /// sha256 over the immutable fields, hex encoded.
    pub fn seal(&self) -> Result<String> {
        let sealed = Sealed {
            id: &self.id,
            code: &self.code,
            user_id: &self.user_id,
            sequence: self.sequence,
            submission_id: self.submission_id.as_deref(),
            kind: self.kind,
            amount: self.amount,
            balance_before: self.balance_before,
            balance_after: self.balance_after,
            category: self.category,
            description: self.description.as_deref(),
            metadata: &self.metadata,
            created_at: &self.created_at,
            prev_digest: self.prev_digest.as_deref(),
        };
        let cbor = minicbor::to_vec(&sealed)?;
        Ok(sha256::digest(&cbor))
    }

    /// Signed effect of this entry on the balance.
    pub fn delta(&self) -> Decimal {
        match self.kind {
            EntryKind::Credit => self.amount.value(),
            EntryKind::Debit => -self.amount.value(),
        }
    }
}

/// Projection of a user's ledger: the row every balance mutation serializes on.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerHead {
    #[n(0)]
    pub sequence: u64,
    #[n(1)]
    pub balance: Fixed,
    #[n(2)]
    pub digest: Option<String>,
    #[n(3)]
    pub updated_at: Option<TimeStamp>,
}

/// An entry waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub user_id: String,
    pub kind: EntryKind,
    pub amount: Decimal,
    pub category: Category,
    pub status: EntryStatus,
    pub submission_id: Option<String>,
    pub description: Option<String>,
    pub metadata: Metadata,
}

impl Posting {
    pub fn credit(user_id: &str, amount: Decimal, category: Category) -> Self {
        Self {
            user_id: user_id.to_string(),
            kind: EntryKind::Credit,
            amount,
            category,
            status: EntryStatus::Completed,
            submission_id: None,
            description: None,
            metadata: Metadata::new(),
        }
    }

    /// Debits wait for external settlement.
    pub fn debit(user_id: &str, amount: Decimal, category: Category) -> Self {
        Self {
            kind: EntryKind::Debit,
            status: EntryStatus::Pending,
            ..Self::credit(user_id, amount, category)
        }
    }

    pub fn for_submission(mut self, submission_id: &str) -> Self {
        self.submission_id = Some(submission_id.to_string());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Id and code reserved for an entry before its transaction starts.
#[derive(Debug, Clone)]
pub(crate) struct Reservation {
    pub id: String,
    pub code: String,
}

impl Reservation {
    pub fn new(store: &Store) -> Result<Self> {
        Ok(Self {
            id: new_uuid_to_bech32(ENTRY_HRP)?,
            code: store.next_code("TXN", 6)?,
        })
    }
}

pub(crate) fn head_key(user_id: &str) -> Result<Vec<u8>> {
    scoped_key(user_id)
}

pub(crate) fn entry_key(user_id: &str, sequence: u64) -> Result<Vec<u8>> {
    let mut key = scoped_key(user_id)?;
    key.extend_from_slice(&sequence.to_be_bytes());
    Ok(key)
}

/// The ledger trees as seen from inside a sled transaction.
pub(crate) struct LedgerTx<'a> {
    pub entries: &'a TransactionalTree,
    pub heads: &'a TransactionalTree,
    pub index: &'a TransactionalTree,
    pub codes: &'a TransactionalTree,
}

impl LedgerTx<'_> {
    pub fn head(&self, user_id: &str) -> TxResult<LedgerHead> {
        match self.heads.get(head_key(user_id).map_err(abort)?)? {
            Some(raw) => decode_tx(&raw),
            None => Ok(LedgerHead::default()),
        }
    }

    /// Append `posting` and move the head in the same transaction.
    pub fn append(&self, posting: &Posting, reservation: &Reservation) -> TxResult<LedgerEntry> {
        if posting.amount <= Decimal::ZERO {
            return Err(abort(Error::InvalidAmount(posting.amount.to_string())));
        }

        let head = self.head(&posting.user_id)?;
        let before = head.balance.value();
        let after = match posting.kind {
            EntryKind::Credit => before.checked_add(posting.amount),
            EntryKind::Debit => before.checked_sub(posting.amount),
        }
        .ok_or_else(|| {
            abort(Error::InvalidAmount(format!(
                "{} would overflow the balance of {}",
                posting.amount, posting.user_id
            )))
        })?;
        if after < Decimal::ZERO {
            return Err(abort(Error::InsufficientBalance {
                balance: before.to_string(),
                requested: posting.amount.to_string(),
            }));
        }
        if self.codes.get(reservation.code.as_bytes())?.is_some() {
            return Err(code_taken());
        }

        let created_at = match &head.updated_at {
            Some(previous) => TimeStamp::after(previous),
            None => TimeStamp::new(),
        };
        let mut entry = LedgerEntry {
            id: reservation.id.clone(),
            code: reservation.code.clone(),
            user_id: posting.user_id.clone(),
            sequence: head.sequence + 1,
            submission_id: posting.submission_id.clone(),
            kind: posting.kind,
            amount: posting.amount.into(),
            balance_before: before.into(),
            balance_after: after.into(),
            category: posting.category,
            status: posting.status,
            description: posting.description.clone(),
            metadata: posting.metadata.clone(),
            created_at,
            prev_digest: head.digest.clone(),
            digest: String::new(),
        };
        entry.digest = entry.seal().map_err(abort)?;

        let key = entry_key(&entry.user_id, entry.sequence).map_err(abort)?;
        let next_head = LedgerHead {
            sequence: entry.sequence,
            balance: entry.balance_after,
            digest: Some(entry.digest.clone()),
            updated_at: Some(entry.created_at.clone()),
        };
        self.entries.insert(key.as_slice(), encode_tx(&entry)?)?;
        self.index.insert(entry.id.as_bytes(), key.as_slice())?;
        self.codes.insert(entry.code.as_bytes(), entry.id.as_bytes())?;
        self.heads
            .insert(head_key(&entry.user_id).map_err(abort)?, encode_tx(&next_head)?)?;

        Ok(entry)
    }
}

/// Bounds on a history scan. All bounds are optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRange {
    /// Only entries with a sequence strictly below this one, for resuming a scan.
    pub before_sequence: Option<u64>,
    pub from: Option<TimeStamp>,
    pub until: Option<TimeStamp>,
}

/// 1-based page of a user's history. Only [`Page::new`] builds one, so the
/// bounds always hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    number: usize,
    limit: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 100;

    pub fn new(number: usize, limit: usize) -> Self {
        Self {
            number: number.max(1),
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }
    pub fn number(&self) -> usize {
        self.number
    }
    pub fn limit(&self) -> usize {
        self.limit
    }
    // saturates, so far-away pages are simply empty
    fn offset(&self) -> usize {
        self.number.saturating_sub(1).saturating_mul(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Newest-first walk over one user's entries.
///
/// Nothing is read until the first call to `next`. [`History::restart`]
/// rewinds to the newest entry, and [`History::cursor`] can seed
/// [`HistoryRange::before_sequence`] to resume in a new scan.
pub struct History {
    entries: sled::Tree,
    user_id: String,
    range: HistoryRange,
    iter: Option<Rev<sled::Iter>>,
    cursor: Option<u64>,
    done: bool,
}

impl History {
    fn new(entries: sled::Tree, user_id: &str, range: HistoryRange) -> Self {
        Self {
            entries,
            user_id: user_id.to_string(),
            range,
            iter: None,
            cursor: None,
            done: false,
        }
    }

    pub fn restart(&mut self) {
        self.iter = None;
        self.cursor = None;
        self.done = false;
    }

    /// Sequence of the last entry yielded.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    fn open(&self) -> Result<Rev<sled::Iter>> {
        let low = entry_key(&self.user_id, 0)?;
        let high = entry_key(&self.user_id, self.range.before_sequence.unwrap_or(u64::MAX))?;
        Ok(self.entries.range(low..high).rev())
    }
}

impl Iterator for History {
    type Item = Result<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.iter.is_none() {
            match self.open() {
                Ok(iter) => self.iter = Some(iter),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let iter = self.iter.as_mut()?;

        loop {
            let raw = match iter.next()? {
                Ok((_, raw)) => raw,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let entry: LedgerEntry = match minicbor::decode(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if self.range.until.as_ref().is_some_and(|until| entry.created_at > *until) {
                continue;
            }
            if self.range.from.as_ref().is_some_and(|from| entry.created_at < *from) {
                self.done = true;
                return None;
            }
            self.cursor = Some(entry.sequence);
            return Some(Ok(entry));
        }
    }
}

/// How the settlement process closed a pending debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Failed,
    Cancelled,
}

impl From<Settlement> for EntryStatus {
    fn from(value: Settlement) -> Self {
        match value {
            Settlement::Completed => EntryStatus::Completed,
            Settlement::Failed => EntryStatus::Failed,
            Settlement::Cancelled => EntryStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub entry: LedgerEntry,
    /// Compensating credit posted when the debit did not go through.
    pub refund: Option<LedgerEntry>,
}

/// Result of a successful [`Ledger::verify`]. Lifetime totals saturate at `Decimal::MAX`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerAudit {
    pub user_id: String,
    pub entries: u64,
    pub credits: Fixed,
    pub debits: Fixed,
    pub balance: Fixed,
}

#[derive(Clone)]
pub struct Ledger {
    store: Store,
    settings: Arc<Settings>,
}

impl Ledger {
    pub fn new(store: Store, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    /// Credit `amount` to `user_id`. The entry is final on creation.
    pub fn post_credit(
        &self,
        user_id: &str,
        amount: Decimal,
        category: Category,
        submission_id: Option<&str>,
        metadata: Metadata,
    ) -> Result<LedgerEntry> {
        let mut posting = Posting::credit(user_id, amount, category).with_metadata(metadata);
        posting.submission_id = submission_id.map(str::to_string);
        self.post(posting)
    }

    /// Debit `amount` from `user_id`. The entry stays pending until settled.
    pub fn post_debit(
        &self,
        user_id: &str,
        amount: Decimal,
        category: Category,
        metadata: Metadata,
    ) -> Result<LedgerEntry> {
        self.post(Posting::debit(user_id, amount, category).with_metadata(metadata))
    }

    /// Append a posting in its own transaction.
    ///
    /// Withdrawal debits must fall within the configured floor and cap.
    pub fn post(&self, posting: Posting) -> Result<LedgerEntry> {
        let amount = posting.amount;
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(amount.to_string()));
        }
        if posting.kind == EntryKind::Debit
            && posting.category == Category::Withdrawal
            && (amount < self.settings.min_withdrawal_amount || amount > self.settings.max_withdrawal_amount)
        {
            return Err(Error::InvalidAmount(format!(
                "{amount} (withdrawals must be between {} and {})",
                self.settings.min_withdrawal_amount, self.settings.max_withdrawal_amount
            )));
        }

        let store = &self.store;
        let entry = with_code_retries("ledger", || {
            let reservation = Reservation::new(store)?;
            let result = (
                &store.entries,
                &store.heads,
                &store.entry_index,
                &store.entry_codes,
            )
                .transaction(|(entries, heads, index, codes)| {
                    let tx = LedgerTx {
                        entries,
                        heads,
                        index,
                        codes,
                    };
                    tx.append(&posting, &reservation)
                });
            finish(result)
        })
        .inspect_err(|err| {
            debug!(user = %posting.user_id, amount = %posting.amount, code = err.code(), "posting rejected")
        })?;

        info!(
            user = %entry.user_id,
            code = %entry.code,
            kind = ?entry.kind,
            amount = %entry.amount,
            balance = %entry.balance_after,
            "ledger entry posted"
        );
        Ok(entry)
    }

    /// `balance_after` of the user's newest entry, or zero.
    pub fn current_balance(&self, user_id: &str) -> Result<Decimal> {
        match self.history(user_id, HistoryRange::default()).next() {
            Some(entry) => Ok(entry?.balance_after.value()),
            None => Ok(Decimal::ZERO),
        }
    }

    pub fn head(&self, user_id: &str) -> Result<LedgerHead> {
        match self.store.heads.get(head_key(user_id)?)? {
            Some(raw) => Ok(minicbor::decode(&raw)?),
            None => Ok(LedgerHead::default()),
        }
    }

    pub fn history(&self, user_id: &str, range: HistoryRange) -> History {
        History::new(self.store.entries.clone(), user_id, range)
    }

    pub fn page(&self, user_id: &str, page: Page) -> Result<Vec<LedgerEntry>> {
        self.history(user_id, HistoryRange::default())
            .skip(page.offset())
            .take(page.limit)
            .collect()
    }

    pub fn entry(&self, entry_id: &str) -> Result<LedgerEntry> {
        let key = self
            .store
            .entry_index
            .get(entry_id.as_bytes())?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;
        let raw = self
            .store
            .entries
            .get(key)?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;
        Ok(minicbor::decode(&raw)?)
    }

    /// Close a pending debit. Only `pending` entries may be settled; anything
    /// else is a `Conflict`. A failed or cancelled debit is compensated by a
    /// withdrawal credit in the same transaction.
    pub fn settle(&self, entry_id: &str, outcome: Settlement) -> Result<Settled> {
        let store = &self.store;
        let settled = with_code_retries("ledger", || {
            let reservation = Reservation::new(store)?;
            let result = (
                &store.entries,
                &store.heads,
                &store.entry_index,
                &store.entry_codes,
            )
                .transaction(|(entries, heads, index, codes)| {
                    let key = index
                        .get(entry_id.as_bytes())?
                        .ok_or_else(|| abort(Error::EntryNotFound(entry_id.to_string())))?;
                    let raw = entries
                        .get(&key[..])?
                        .ok_or_else(|| abort(Error::EntryNotFound(entry_id.to_string())))?;
                    let mut entry: LedgerEntry = decode_tx(&raw)?;

                    if entry.kind != EntryKind::Debit || entry.status != EntryStatus::Pending {
                        return Err(abort(Error::Conflict(format!(
                            "entry {} is a {:?} in status {}",
                            entry.code, entry.kind, entry.status
                        ))));
                    }
                    entry.status = outcome.into();
                    entries.insert(&key[..], encode_tx(&entry)?)?;

                    let refund = match outcome {
                        Settlement::Completed => None,
                        Settlement::Failed | Settlement::Cancelled => {
                            let mut metadata = Metadata::new();
                            metadata.insert("refund_of".into(), entry.code.clone());
                            let posting =
                                Posting::credit(&entry.user_id, entry.amount.value(), Category::Withdrawal)
                                    .describe(format!("refund of {}", entry.code))
                                    .with_metadata(metadata);
                            let tx = LedgerTx {
                                entries,
                                heads,
                                index,
                                codes,
                            };
                            Some(tx.append(&posting, &reservation)?)
                        }
                    };
                    Ok(Settled { entry, refund })
                });
            finish(result)
        })?;

        info!(
            user = %settled.entry.user_id,
            code = %settled.entry.code,
            status = %settled.entry.status,
            refunded = settled.refund.is_some(),
            "debit settled"
        );
        Ok(settled)
    }

    /// Walk the user's entries oldest first and check sequence continuity,
    /// balance arithmetic, the digest chain and the head projection.
    pub fn verify(&self, user_id: &str) -> Result<LedgerAudit> {
        let corrupted = |sequence: u64, reason: String| Error::LedgerCorrupted {
            user: user_id.to_string(),
            sequence,
            reason,
        };

        let mut expected_sequence = 1;
        let mut balance = Decimal::ZERO;
        let mut credits = Decimal::ZERO;
        let mut debits = Decimal::ZERO;
        let mut previous_digest: Option<String> = None;

        for item in self.store.entries.scan_prefix(scoped_key(user_id)?) {
            let (_, raw) = item?;
            let entry: LedgerEntry = minicbor::decode(&raw)?;
            let sequence = entry.sequence;

            if sequence != expected_sequence {
                return Err(corrupted(sequence, format!("expected sequence {expected_sequence}")));
            }
            if entry.prev_digest != previous_digest {
                return Err(corrupted(sequence, "digest chain is broken".into()));
            }
            if entry.seal()? != entry.digest {
                return Err(corrupted(sequence, "entry content does not match its digest".into()));
            }
            if entry.balance_before.value() != balance {
                return Err(corrupted(sequence, format!("balance_before should be {balance}")));
            }
            if entry.balance_before.value().checked_add(entry.delta()) != Some(entry.balance_after.value()) {
                return Err(corrupted(sequence, "balance_after does not follow from amount".into()));
            }
            if entry.balance_after.value() < Decimal::ZERO {
                return Err(corrupted(sequence, "balance went negative".into()));
            }

            match entry.kind {
                EntryKind::Credit => credits = credits.saturating_add(entry.amount.value()),
                EntryKind::Debit => debits = debits.saturating_add(entry.amount.value()),
            }
            balance = entry.balance_after.value();
            previous_digest = Some(entry.digest);
            expected_sequence += 1;
        }

        let head = self.head(user_id)?;
        let entries = expected_sequence - 1;
        if head.sequence != entries || head.balance.value() != balance || head.digest != previous_digest {
            warn!(user = user_id, "ledger head disagrees with entries");
            return Err(corrupted(head.sequence, "head does not match the newest entry".into()));
        }

        Ok(LedgerAudit {
            user_id: user_id.to_string(),
            entries,
            credits: credits.into(),
            debits: debits.into(),
            balance: balance.into(),
        })
    }
}
