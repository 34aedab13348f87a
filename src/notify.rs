//! Hooks for whatever needs to hear about committed changes.
//!
//! Observers run after the write has committed and cannot veto or roll it
//! back. Push notifications, email and the like plug in here.
use super::ledger::LedgerEntry;
use super::submission::{Submission, SubmissionStatus};
use super::types::Rating;
use tracing::info;

#[derive(Debug, Clone)]
pub enum Event {
    SubmissionCreated(Submission),
    StatusChanged {
        submission: Submission,
        from: SubmissionStatus,
    },
    PayoutCredited {
        submission: Submission,
        entry: LedgerEntry,
    },
    SubmissionRated {
        submission: Submission,
        rating: Rating,
    },
    WithdrawalRequested(LedgerEntry),
    WithdrawalSettled {
        entry: LedgerEntry,
        refund: Option<LedgerEntry>,
    },
    BonusGranted(LedgerEntry),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SubmissionCreated(_) => "submission_created",
            Event::StatusChanged { .. } => "status_changed",
            Event::PayoutCredited { .. } => "payout_credited",
            Event::SubmissionRated { .. } => "submission_rated",
            Event::WithdrawalRequested(_) => "withdrawal_requested",
            Event::WithdrawalSettled { .. } => "withdrawal_settled",
            Event::BonusGranted(_) => "bonus_granted",
        }
    }

    /// User the event concerns.
    pub fn user_id(&self) -> &str {
        match self {
            Event::SubmissionCreated(submission)
            | Event::StatusChanged { submission, .. }
            | Event::PayoutCredited { submission, .. }
            | Event::SubmissionRated { submission, .. } => &submission.user_id,
            Event::WithdrawalRequested(entry)
            | Event::WithdrawalSettled { entry, .. }
            | Event::BonusGranted(entry) => &entry.user_id,
        }
    }
}

pub trait Observer: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn notify(&self, event: &Event) {
        info!(event = event.name(), user = event.user_id(), "notification");
    }
}
