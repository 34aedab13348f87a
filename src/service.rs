//! Service layer API for the marketplace core
use super::catalog::{Catalog, SledCatalog};
use super::config::Settings;
use super::error::{Error, Result};
use super::ledger::{
    Category, HistoryRange, History, Ledger, LedgerAudit, LedgerEntry, LedgerTx, Metadata, Page, Posting,
    Reservation, Settled, Settlement,
};
use super::notify::{Event, Observer};
use super::pricing::{Tariff, weight_deviation_percentage};
use super::rating::{self, RatingAggregate, Ratings};
use super::store::{Store, TxResult, abort, code_taken, decode_tx, encode_tx, finish, flatten, with_code_retries};
use super::submission::{NewSubmission, Submission, SubmissionStatus, Transition};
use super::types::Rating;
use super::utils::{SUBMISSION_HRP, new_uuid_to_bech32, scoped_key};
use rust_decimal::Decimal;
use sled::Transactional;
use sled::transaction::TransactionalTree;
use std::sync::Arc;
use tracing::{debug, info};

/// A status change as requested by an operator or the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub transition: Transition,
    pub actor: String,
    /// Fail with `Conflict` unless the stored version still matches.
    pub expected_version: Option<u64>,
}

impl TransitionRequest {
    pub fn new(transition: Transition, actor: impl Into<String>) -> Self {
        Self {
            transition,
            actor: actor.into(),
            expected_version: None,
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Where a withdrawal should be paid out to. Stored as entry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutDestination {
    pub bank_name: String,
    pub account_number: String,
    pub account_name: String,
}

impl PayoutDestination {
    fn to_metadata(&self) -> Result<Metadata> {
        let fields = [
            ("bank_name", &self.bank_name),
            ("account_number", &self.account_number),
            ("account_name", &self.account_name),
        ];
        let mut metadata = Metadata::new();
        for (key, value) in fields {
            if value.trim().is_empty() {
                return Err(Error::InvalidReference(format!("payout destination is missing {key}")));
            }
            metadata.insert(key.to_string(), value.trim().to_string());
        }
        Ok(metadata)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightCheck {
    pub declared: Decimal,
    pub actual: Decimal,
    pub deviation_percentage: Decimal,
    pub tolerance_percentage: Decimal,
}

impl WeightCheck {
    pub fn within_tolerance(&self) -> bool {
        self.deviation_percentage <= self.tolerance_percentage
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStats {
    pub total_submissions: u64,
    pub completed_submissions: u64,
    pub declared_weight: Decimal,
    /// Sum of net payouts over completed submissions.
    pub total_earned: Decimal,
    pub balance: Decimal,
}

pub struct Marketplace<C: Catalog = SledCatalog> {
    store: Store,
    ledger: Ledger,
    ratings: Ratings,
    catalog: C,
    settings: Arc<Settings>,
    observers: Vec<Arc<dyn Observer>>,
}

impl<C: Catalog> Marketplace<C> {
    pub fn new(instance: Arc<sled::Db>, catalog: C, settings: Settings) -> Result<Self> {
        let store = Store::new(instance)?;
        let settings = Arc::new(settings);
        Ok(Self {
            ledger: Ledger::new(store.clone(), settings.clone()),
            ratings: Ratings::new(store.clone()),
            store,
            catalog,
            settings,
            observers: Vec::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    fn publish(&self, event: Event) {
        for observer in &self.observers {
            observer.notify(&event);
        }
    }

    fn tariff(&self, price_per_kg: Decimal) -> Tariff {
        Tariff::new(price_per_kg, self.settings.fee_rate, self.settings.currency_scale)
    }

    /// Register a new submission in `pending`, valued at today's catalog price.
    pub fn create_submission(&self, input: NewSubmission) -> Result<Submission> {
        let weight = input.declared_weight;
        if weight <= Decimal::ZERO || !self.settings.accepts_weight(weight) {
            return Err(Error::InvalidWeight(format!(
                "{weight} (must be between {} and {} kg)",
                self.settings.min_submission_weight, self.settings.max_submission_weight
            )));
        }
        let max = self.settings.max_photos_per_submission;
        if input.photos.len() > max {
            return Err(Error::TooManyPhotos {
                max,
                got: input.photos.len(),
            });
        }

        match self.catalog.bank(&input.bank_id)? {
            Some(bank) if bank.is_active => {}
            _ => return Err(Error::InvalidReference(format!("waste bank {}", input.bank_id))),
        }
        let waste_type = match self.catalog.waste_type(&input.waste_type_id)? {
            Some(waste_type) if waste_type.is_active => waste_type,
            _ => {
                return Err(Error::InvalidReference(format!("waste type {}", input.waste_type_id)));
            }
        };
        let unit_price = waste_type.price_per_kg;
        let estimated_value = self.tariff(unit_price.value()).estimate(weight)?;

        let store = &self.store;
        let submission = with_code_retries("submission", || {
            let id = new_uuid_to_bech32(SUBMISSION_HRP)?;
            let code = store.next_code("SUB", 4)?;
            let submission = Submission::new(id, code, input.clone(), unit_price, estimated_value);
            let owner_key = user_key(&submission)?;
            let result = (&store.submissions, &store.submission_codes, &store.user_submissions).transaction(
                |(submissions, codes, by_user)| {
                    if codes.get(submission.code.as_bytes())?.is_some() {
                        return Err(code_taken());
                    }
                    submissions.insert(submission.id.as_bytes(), encode_tx(&submission)?)?;
                    codes.insert(submission.code.as_bytes(), submission.id.as_bytes())?;
                    by_user.insert(owner_key.as_slice(), submission.id.as_bytes())?;
                    Ok(())
                },
            );
            Ok(finish(result)?.map(|()| submission))
        })?;

        info!(
            user = %submission.user_id,
            code = %submission.code,
            weight = %submission.declared_weight,
            estimate = %submission.estimated_value,
            "submission created"
        );
        self.publish(Event::SubmissionCreated(submission.clone()));
        Ok(submission)
    }

    /// Move a submission along its lifecycle.
    ///
    /// Completing a submission credits its net payout to the owner in the
    /// same transaction that writes the `completed` status.
    pub fn transition_submission(&self, submission_id: &str, request: TransitionRequest) -> Result<Submission> {
        self.commit_transition(submission_id, &request, |_| Ok(()))
    }

    /// Owner-initiated cancellation, allowed while `pending` or `confirmed`.
    pub fn cancel_submission(&self, submission_id: &str, user_id: &str, reason: Option<String>) -> Result<Submission> {
        let request = TransitionRequest::new(Transition::Cancel { reason }, user_id);
        self.commit_transition(submission_id, &request, |submission| {
            submission.ensure_owner(user_id)?;
            if !submission.status.owner_cancellable() {
                return Err(Error::IllegalTransition {
                    from: submission.status,
                    to: SubmissionStatus::Cancelled,
                });
            }
            Ok(())
        })
    }

    fn commit_transition(
        &self,
        submission_id: &str,
        request: &TransitionRequest,
        guard: impl Fn(&Submission) -> Result<()>,
    ) -> Result<Submission> {
        let tariff = match &request.transition {
            Transition::Process { actual_weight, .. } => {
                let max = self.settings.max_processed_weight;
                if *actual_weight > max {
                    return Err(Error::InvalidWeight(format!("{actual_weight} (at most {max} kg can be processed)")));
                }
                let current = self.submission(submission_id)?;
                let waste_type = self
                    .catalog
                    .waste_type(&current.waste_type_id)?
                    .ok_or_else(|| Error::InvalidReference(format!("waste type {}", current.waste_type_id)))?;
                Some(self.tariff(waste_type.price_per_kg.value()))
            }
            _ => None,
        };
        let completes = request.transition.target() == SubmissionStatus::Completed;

        let store = &self.store;
        let (submission, from, payout) = with_code_retries("ledger", || {
            let reservation = if completes { Some(Reservation::new(store)?) } else { None };
            let result = (
                &store.submissions,
                &store.entries,
                &store.heads,
                &store.entry_index,
                &store.entry_codes,
            )
                .transaction(|(submissions, entries, heads, index, codes)| {
                    let mut submission = load_tx(submissions, submission_id)?;
                    if let Some(expected) = request.expected_version.filter(|v| *v != submission.version) {
                        return Err(abort(Error::Conflict(format!(
                            "submission {} is at version {}, expected {expected}",
                            submission.code, submission.version
                        ))));
                    }
                    guard(&submission).map_err(abort)?;

                    let from = submission.status;
                    submission
                        .apply(&request.transition, &request.actor, tariff.as_ref())
                        .map_err(abort)?;

                    let payout = match (&reservation, submission.net_payout) {
                        (Some(reservation), Some(amount)) if amount.is_positive() => {
                            let posting = Posting::credit(&submission.user_id, amount.value(), Category::WasteSale)
                                .for_submission(&submission.id)
                                .describe(format!("payout for {}", submission.code));
                            let tx = LedgerTx {
                                entries,
                                heads,
                                index,
                                codes,
                            };
                            Some(tx.append(&posting, reservation)?)
                        }
                        (Some(_), _) => {
                            return Err(abort(Error::InvalidAmount(format!(
                                "{} has no payout to credit",
                                submission.code
                            ))));
                        }
                        (None, _) => None,
                    };

                    submissions.insert(submission.id.as_bytes(), encode_tx(&submission)?)?;
                    Ok((submission, from, payout))
                });
            finish(result)
        })
        .inspect_err(|err| {
            debug!(submission = submission_id, code = err.code(), "transition rejected");
        })?;

        info!(
            code = %submission.code,
            from = %from,
            to = %submission.status,
            actor = %request.actor,
            version = submission.version,
            "submission transitioned"
        );
        self.publish(Event::StatusChanged {
            submission: submission.clone(),
            from,
        });
        if let Some(entry) = payout {
            info!(user = %entry.user_id, code = %entry.code, amount = %entry.amount, "payout credited");
            self.publish(Event::PayoutCredited {
                submission: submission.clone(),
                entry,
            });
        }
        Ok(submission)
    }

    /// Rate a completed submission and fold the rating into its bank's average.
    pub fn rate_submission(
        &self,
        submission_id: &str,
        user_id: &str,
        rating: u8,
        review: Option<String>,
    ) -> Result<Submission> {
        let rating = Rating::new(rating)?;
        let store = &self.store;

        let (submission, aggregate) = (&store.submissions, &store.bank_ratings)
            .transaction(|(submissions, bank_ratings)| {
                let mut submission = load_tx(submissions, submission_id)?;
                submission
                    .rate(user_id, rating, review.clone())
                    .map_err(abort)?;
                submissions.insert(submission.id.as_bytes(), encode_tx(&submission)?)?;
                let aggregate = rating::apply_in(bank_ratings, &submission.bank_id, rating)?;
                Ok((submission, aggregate))
            })
            .map_err(flatten)?;

        info!(
            code = %submission.code,
            bank = %submission.bank_id,
            rating = rating.value(),
            average = %aggregate.average,
            count = aggregate.count,
            "submission rated"
        );
        self.publish(Event::SubmissionRated {
            submission: submission.clone(),
            rating,
        });
        Ok(submission)
    }

    pub fn get_balance(&self, user_id: &str) -> Result<Decimal> {
        self.ledger.current_balance(user_id)
    }

    pub fn list_ledger_history(&self, user_id: &str, page: Page) -> Result<Vec<LedgerEntry>> {
        self.ledger.page(user_id, page)
    }

    /// Lazy newest-first history, for callers that want to stream.
    pub fn ledger_history(&self, user_id: &str, range: HistoryRange) -> History {
        self.ledger.history(user_id, range)
    }

    /// Reserve `amount` for payout. The debit stays pending until settled.
    pub fn request_withdrawal(
        &self,
        user_id: &str,
        amount: Decimal,
        destination: &PayoutDestination,
    ) -> Result<LedgerEntry> {
        let metadata = destination.to_metadata()?;
        let entry = self
            .ledger
            .post_debit(user_id, amount, Category::Withdrawal, metadata)?;
        self.publish(Event::WithdrawalRequested(entry.clone()));
        Ok(entry)
    }

    /// Record the settlement outcome of a pending withdrawal.
    pub fn settle_withdrawal(&self, entry_id: &str, outcome: Settlement) -> Result<Settled> {
        let settled = self.ledger.settle(entry_id, outcome)?;
        self.publish(Event::WithdrawalSettled {
            entry: settled.entry.clone(),
            refund: settled.refund.clone(),
        });
        Ok(settled)
    }

    pub fn grant_bonus(&self, user_id: &str, amount: Decimal, description: &str) -> Result<LedgerEntry> {
        let posting = Posting::credit(user_id, amount, Category::Bonus).describe(description);
        let entry = self.ledger.post(posting)?;
        self.publish(Event::BonusGranted(entry.clone()));
        Ok(entry)
    }

    pub fn verify_ledger(&self, user_id: &str) -> Result<LedgerAudit> {
        self.ledger.verify(user_id)
    }

    pub fn bank_rating(&self, bank_id: &str) -> Result<RatingAggregate> {
        self.ratings.get(bank_id)
    }

    pub fn submission(&self, submission_id: &str) -> Result<Submission> {
        match self.store.submissions.get(submission_id.as_bytes())? {
            Some(raw) => Ok(minicbor::decode(&raw)?),
            None => Err(Error::SubmissionNotFound(submission_id.to_string())),
        }
    }

    /// Look a submission up by its `SUB...` code.
    pub fn submission_by_code(&self, code: &str) -> Result<Submission> {
        let id = self
            .store
            .submission_codes
            .get(code.as_bytes())?
            .ok_or_else(|| Error::SubmissionNotFound(code.to_string()))?;
        self.submission(&String::from_utf8_lossy(&id))
    }

    /// The user's submissions, newest first.
    pub fn submissions_for_user(&self, user_id: &str) -> Result<Vec<Submission>> {
        self.store
            .user_submissions
            .scan_prefix(scoped_key(user_id)?)
            .rev()
            .map(|item| {
                let (_, id) = item?;
                self.submission(&String::from_utf8_lossy(&id))
            })
            .collect()
    }

    pub fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        let mut stats = UserStats {
            balance: self.get_balance(user_id)?,
            ..UserStats::default()
        };
        for submission in self.submissions_for_user(user_id)? {
            stats.total_submissions += 1;
            stats.declared_weight += submission.declared_weight.value();
            if submission.status == SubmissionStatus::Completed {
                stats.completed_submissions += 1;
                stats.total_earned += submission.net_payout.map(Decimal::from).unwrap_or_default();
            }
        }
        Ok(stats)
    }

    /// Compare an actual weight with the declared one. Advisory only; nothing is written.
    pub fn check_weight(&self, submission_id: &str, actual_weight: Decimal) -> Result<WeightCheck> {
        if actual_weight <= Decimal::ZERO {
            return Err(Error::InvalidWeight(actual_weight.to_string()));
        }
        let submission = self.submission(submission_id)?;
        let declared = submission.declared_weight.value();
        Ok(WeightCheck {
            declared,
            actual: actual_weight,
            deviation_percentage: weight_deviation_percentage(declared, actual_weight)?,
            tolerance_percentage: self.settings.weight_tolerance_percentage,
        })
    }
}

fn load_tx(submissions: &TransactionalTree, submission_id: &str) -> TxResult<Submission> {
    match submissions.get(submission_id.as_bytes())? {
        Some(raw) => decode_tx(&raw),
        None => Err(abort(Error::SubmissionNotFound(submission_id.to_string()))),
    }
}

// user ‖ created_at ‖ id, so a prefix scan walks one user's submissions in creation order
fn user_key(submission: &Submission) -> Result<Vec<u8>> {
    let mut key = scoped_key(&submission.user_id)?;
    let nanos = (submission.created_at.nanos() as u64) ^ (1 << 63);
    key.extend_from_slice(&nanos.to_be_bytes());
    key.extend_from_slice(submission.id.as_bytes());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{WasteBank, WasteType};
    use rust_decimal_macros::dec;

    fn marketplace() -> Marketplace {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let catalog = SledCatalog::open(&db).unwrap();
        catalog
            .upsert_bank(&WasteBank {
                id: "bank_a".into(),
                name: "Bank Sampah Melati".into(),
                is_active: true,
            })
            .unwrap();
        catalog
            .upsert_waste_type(&WasteType {
                id: "pet".into(),
                name: "Botol PET".into(),
                category: "plastic".into(),
                price_per_kg: dec!(3000).into(),
                is_active: true,
            })
            .unwrap();
        Marketplace::new(db, catalog, Settings::default()).unwrap()
    }

    fn input(weight: Decimal) -> NewSubmission {
        NewSubmission {
            user_id: "user_a".into(),
            bank_id: "bank_a".into(),
            waste_type_id: "pet".into(),
            declared_weight: weight,
            photos: vec![],
            description: None,
        }
    }

    #[test]
    fn creation_validates_before_writing() {
        let market = marketplace();

        let err = market.create_submission(input(dec!(0.05))).unwrap_err();
        assert_eq!(err.code(), "invalid_weight");
        let err = market.create_submission(input(dec!(101))).unwrap_err();
        assert_eq!(err.code(), "invalid_weight");

        let mut photos = input(dec!(1));
        photos.photos = (0..6).map(|i| format!("/uploads/{i}.jpg")).collect();
        assert_eq!(
            market.create_submission(photos).unwrap_err(),
            Error::TooManyPhotos { max: 5, got: 6 }
        );

        let mut unknown = input(dec!(1));
        unknown.bank_id = "nowhere".into();
        assert_eq!(market.create_submission(unknown).unwrap_err().code(), "invalid_reference");

        assert!(market.submissions_for_user("user_a").unwrap().is_empty());
    }

    #[test]
    fn estimate_uses_catalog_price() {
        let market = marketplace();
        let submission = market.create_submission(input(dec!(2.5))).unwrap();

        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.estimated_value, dec!(7500));
        assert!(submission.id.starts_with("sub1"));
        assert_eq!(market.submission_by_code(&submission.code).unwrap(), submission);
    }

    #[test]
    fn weight_check_is_advisory() {
        let market = marketplace();
        let submission = market.create_submission(input(dec!(10))).unwrap();

        let close = market.check_weight(&submission.id, dec!(11)).unwrap();
        let far = market.check_weight(&submission.id, dec!(13)).unwrap();
        assert!(close.within_tolerance());
        assert!(!far.within_tolerance());
        assert_eq!(far.deviation_percentage, dec!(30));
        assert_eq!(market.submission(&submission.id).unwrap(), submission);
    }

    #[test]
    fn destination_fields_are_required() {
        let destination = PayoutDestination {
            bank_name: "BCA".into(),
            account_number: " ".into(),
            account_name: "Sari".into(),
        };
        assert_eq!(destination.to_metadata().unwrap_err().code(), "invalid_reference");
    }
}
