//! Waste submissions and the lifecycle state machine that governs them
use super::error::{Error, Result};
use super::pricing::Tariff;
use super::types::{Fixed, Rating, TimeStamp};
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum SubmissionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Confirmed,
    #[n(2)]
    PickedUp,
    #[n(3)]
    Processed,
    #[n(4)]
    Completed,
    #[n(5)]
    Cancelled,
    #[n(6)]
    Rejected,
}

use SubmissionStatus::*;

/// Every legal `(from, to)` pair. Anything absent is rejected.
pub const TRANSITIONS: &[(SubmissionStatus, SubmissionStatus)] = &[
    (Pending, Confirmed),
    (Pending, Cancelled),
    (Pending, Rejected),
    (Confirmed, PickedUp),
    (Confirmed, Cancelled),
    (Confirmed, Rejected),
    (PickedUp, Processed),
    (PickedUp, Cancelled),
    (Processed, Completed),
];

impl SubmissionStatus {
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        TRANSITIONS.contains(&(self, next))
    }
    pub fn is_terminal(self) -> bool {
        matches!(self, Completed | Cancelled | Rejected)
    }
    /// States the owner may still withdraw from.
    pub fn owner_cancellable(self) -> bool {
        matches!(self, Pending | Confirmed)
    }
    pub fn as_str(self) -> &'static str {
        match self {
            Pending => "pending",
            Confirmed => "confirmed",
            PickedUp => "picked_up",
            Processed => "processed",
            Completed => "completed",
            Cancelled => "cancelled",
            Rejected => "rejected",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, minicbor::Encode, minicbor::Decode)]
pub struct PickupDetails {
    #[n(0)]
    pub address: String,
    #[n(1)]
    pub scheduled_for: Option<TimeStamp>,
    #[n(2)]
    pub time_slot: Option<String>, // e.g. "08:00-10:00"
    #[n(3)]
    pub notes: Option<String>,
}

impl PickupDetails {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
    fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::InvalidPickup("address is required".into()));
        }
        Ok(())
    }
}

/// A requested status change together with the data that status needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Confirm { note: Option<String> },
    PickUp(PickupDetails),
    Process { actual_weight: Decimal, notes: Option<String> },
    Complete,
    Cancel { reason: Option<String> },
    Reject { reason: String },
}

impl Transition {
    pub fn target(&self) -> SubmissionStatus {
        match self {
            Transition::Confirm { .. } => Confirmed,
            Transition::PickUp(_) => PickedUp,
            Transition::Process { .. } => Processed,
            Transition::Complete => Completed,
            Transition::Cancel { .. } => Cancelled,
            Transition::Reject { .. } => Rejected,
        }
    }
}

// one entry per applied transition, never rewritten
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StatusChange {
    #[n(0)]
    pub from: SubmissionStatus,
    #[n(1)]
    pub to: SubmissionStatus,
    #[n(2)]
    pub actor: String,
    #[n(3)]
    pub at: TimeStamp,
}

/// Validated input for a new submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubmission {
    pub user_id: String,
    pub bank_id: String,
    pub waste_type_id: String,
    pub declared_weight: Decimal,
    pub photos: Vec<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Submission {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub code: String,
    #[n(2)]
    pub user_id: String,
    #[n(3)]
    pub bank_id: String,
    #[n(4)]
    pub waste_type_id: String,
    #[n(5)]
    pub declared_weight: Fixed,
    #[n(6)]
    pub actual_weight: Option<Fixed>,
    #[n(7)]
    pub unit_price: Fixed, // price per kg the latest valuation used
    #[n(8)]
    pub estimated_value: Fixed,
    #[n(9)]
    pub actual_value: Option<Fixed>,
    #[n(10)]
    pub platform_fee: Option<Fixed>,
    #[n(11)]
    pub net_payout: Option<Fixed>,
    #[n(12)]
    pub description: Option<String>,
    #[n(13)]
    pub photos: Vec<String>,
    #[n(14)]
    pub status: SubmissionStatus,
    #[n(15)]
    pub created_at: TimeStamp,
    #[n(16)]
    pub updated_at: TimeStamp,
    #[n(17)]
    pub confirmed_at: Option<TimeStamp>,
    #[n(18)]
    pub picked_up_at: Option<TimeStamp>,
    #[n(19)]
    pub processed_at: Option<TimeStamp>,
    #[n(20)]
    pub completed_at: Option<TimeStamp>,
    #[n(21)]
    pub cancelled_at: Option<TimeStamp>,
    #[n(22)]
    pub rejected_at: Option<TimeStamp>,
    #[n(23)]
    pub pickup: Option<PickupDetails>,
    #[n(24)]
    pub processing_notes: Option<String>,
    #[n(25)]
    pub processed_by: Option<String>,
    #[n(26)]
    pub admin_note: Option<String>,
    #[n(27)]
    pub cancel_reason: Option<String>,
    #[n(28)]
    pub rating: Option<Rating>,
    #[n(29)]
    pub review: Option<String>,
    #[n(30)]
    pub version: u64,
    #[n(31)]
    pub history: Vec<StatusChange>,
}

impl Submission {
    pub fn new(id: String, code: String, input: NewSubmission, unit_price: Fixed, estimated_value: Fixed) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            code,
            user_id: input.user_id,
            bank_id: input.bank_id,
            waste_type_id: input.waste_type_id,
            declared_weight: input.declared_weight.into(),
            actual_weight: None,
            unit_price,
            estimated_value,
            actual_value: None,
            platform_fee: None,
            net_payout: None,
            description: input.description,
            photos: input.photos,
            status: Pending,
            created_at: now.clone(),
            updated_at: now,
            confirmed_at: None,
            picked_up_at: None,
            processed_at: None,
            completed_at: None,
            cancelled_at: None,
            rejected_at: None,
            pickup: None,
            processing_notes: None,
            processed_by: None,
            admin_note: None,
            cancel_reason: None,
            rating: None,
            review: None,
            version: 0,
            history: vec![],
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    pub fn ensure_owner(&self, user_id: &str) -> Result<()> {
        if self.is_owned_by(user_id) {
            Ok(())
        } else {
            Err(Error::Forbidden(user_id.to_string()))
        }
    }

    /// Validate and apply `transition`. On error the submission is left untouched.
    ///
    /// `tariff` is only consulted by [`Transition::Process`], which fails with
    /// `InvalidReference` when it is missing.
    pub fn apply(&mut self, transition: &Transition, actor: &str, tariff: Option<&Tariff>) -> Result<()> {
        let from = self.status;
        let to = transition.target();
        if !from.can_transition_to(to) {
            return Err(Error::IllegalTransition { from, to });
        }

        let at = TimeStamp::after(&self.updated_at);
        match transition {
            Transition::Confirm { note } => {
                if note.is_some() {
                    self.admin_note = note.clone();
                }
                self.confirmed_at = Some(at.clone());
            }
            Transition::PickUp(details) => {
                details.validate()?;
                self.pickup = Some(details.clone());
                self.picked_up_at = Some(at.clone());
            }
            Transition::Process {
                actual_weight,
                notes,
            } => {
                if *actual_weight <= Decimal::ZERO {
                    return Err(Error::InvalidWeight(actual_weight.to_string()));
                }
                let tariff = tariff
                    .ok_or_else(|| Error::InvalidReference(format!("price of {}", self.waste_type_id)))?;
                let valuation = tariff.value(*actual_weight)?;
                // a completed submission always owes its owner a ledger credit
                if !valuation.payout.is_positive() {
                    return Err(Error::InvalidAmount(format!(
                        "{} kg of {} pays out {}",
                        actual_weight, self.waste_type_id, valuation.payout
                    )));
                }

                self.actual_weight = Some((*actual_weight).into());
                self.unit_price = tariff.price_per_kg.into();
                self.actual_value = Some(valuation.gross);
                self.platform_fee = Some(valuation.fee);
                self.net_payout = Some(valuation.payout);
                self.processing_notes = notes.clone();
                self.processed_by = Some(actor.to_string());
                self.processed_at = Some(at.clone());
            }
            Transition::Complete => {
                self.completed_at = Some(at.clone());
            }
            Transition::Cancel { reason } => {
                self.cancel_reason = reason.clone();
                self.cancelled_at = Some(at.clone());
            }
            Transition::Reject { reason } => {
                self.admin_note = Some(reason.clone());
                self.rejected_at = Some(at.clone());
            }
        }

        self.history.push(StatusChange {
            from,
            to,
            actor: actor.to_string(),
            at: at.clone(),
        });
        self.status = to;
        self.touch(at);
        Ok(())
    }

    /// Attach the owner's rating. Checks run in the order a caller would fix them.
    pub fn rate(&mut self, user_id: &str, rating: Rating, review: Option<String>) -> Result<()> {
        self.ensure_owner(user_id)?;
        if self.status != Completed {
            return Err(Error::NotRatable(self.status));
        }
        if self.rating.is_some() {
            return Err(Error::AlreadyRated);
        }

        self.rating = Some(rating);
        self.review = review;
        let at = TimeStamp::after(&self.updated_at);
        self.touch(at);
        Ok(())
    }

    /// Stamps of the transitions taken so far, in lifecycle order.
    pub fn transition_stamps(&self) -> Vec<&TimeStamp> {
        [
            &self.confirmed_at,
            &self.picked_up_at,
            &self.processed_at,
            &self.completed_at,
            &self.cancelled_at,
            &self.rejected_at,
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Number of terminal markers set; 1 for terminal submissions, 0 otherwise.
    pub fn terminal_markers(&self) -> usize {
        [&self.completed_at, &self.cancelled_at, &self.rejected_at]
            .into_iter()
            .filter(|stamp| stamp.is_some())
            .count()
    }

    fn touch(&mut self, at: TimeStamp) {
        self.updated_at = at;
        self.version += 1;
    }
}
