//! Core of a recycling-rewards marketplace: the submission lifecycle, the
//! balance ledger it pays into, and per-bank rating aggregates.
//!
//! Everything is persisted in one sled database. [`Marketplace`] is the entry
//! point; it is `Send + Sync` and meant to be shared behind an `Arc`.

pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod pricing;
pub mod rating;
pub mod service;
pub mod store;
pub mod submission;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use catalog::{Catalog, SledCatalog, WasteBank, WasteType};
pub use config::Settings;
pub use error::{Error, Result};
pub use ledger::{
    Category, EntryKind, EntryStatus, HistoryRange, Ledger, LedgerAudit, LedgerEntry, LedgerHead, Page, Settled,
    Settlement,
};
pub use notify::{Event, LogObserver, Observer};
pub use rating::RatingAggregate;
pub use service::{Marketplace, PayoutDestination, TransitionRequest, UserStats, WeightCheck};
pub use submission::{NewSubmission, PickupDetails, Submission, SubmissionStatus, Transition};
pub use types::{Fixed, Rating, TimeStamp};
