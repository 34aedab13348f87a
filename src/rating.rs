//! Running average of user ratings per waste bank.
use super::error::Result;
use super::pricing::round_half_up;
use super::store::{Store, TxResult, decode_tx, encode_tx};
use super::types::{Fixed, Rating};
use rust_decimal::Decimal;
use sled::transaction::TransactionalTree;

#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RatingAggregate {
    /// Rounded to two decimal places after every update.
    #[n(0)]
    pub average: Fixed,
    #[n(1)]
    pub count: u64,
}

impl RatingAggregate {
    /// Fold one more rating into the average.
    pub fn apply(&self, rating: Rating) -> Self {
        let count = self.count + 1;
        let total = self.average.value() * Decimal::from(self.count) + Decimal::from(rating.value());
        Self {
            average: round_half_up(total / Decimal::from(count), 2).into(),
            count,
        }
    }
}

/// Read-modify-write of a bank's aggregate inside a caller's transaction.
///
/// Concurrent ratings for the same bank conflict on the aggregate key, so
/// sled reruns the losing transaction against the committed value.
pub(crate) fn apply_in(ratings: &TransactionalTree, bank_id: &str, rating: Rating) -> TxResult<RatingAggregate> {
    let current = match ratings.get(bank_id.as_bytes())? {
        Some(raw) => decode_tx(&raw)?,
        None => RatingAggregate::default(),
    };
    let next = current.apply(rating);
    ratings.insert(bank_id.as_bytes(), encode_tx(&next)?)?;
    Ok(next)
}

#[derive(Clone)]
pub struct Ratings {
    store: Store,
}

impl Ratings {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn get(&self, bank_id: &str) -> Result<RatingAggregate> {
        match self.store.bank_ratings.get(bank_id.as_bytes())? {
            Some(raw) => Ok(minicbor::decode(&raw)?),
            None => Ok(RatingAggregate::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn rating(value: u8) -> Rating {
        Rating::new(value).unwrap()
    }

    #[test]
    fn average_rounds_each_step() {
        let aggregate = RatingAggregate::default()
            .apply(rating(5))
            .apply(rating(4))
            .apply(rating(4));

        assert_eq!(aggregate.count, 3);
        assert_eq!(aggregate.average, dec!(4.33));
    }

    #[test]
    fn average_is_weighted_by_count() {
        let aggregate = RatingAggregate {
            average: dec!(4.5).into(),
            count: 2,
        }
        .apply(rating(3));
        assert_eq!(aggregate.average, dec!(4.00));
        assert_eq!(RatingAggregate::default().apply(rating(2)).average, dec!(2));
    }

    #[test]
    fn stored_per_bank() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ratings = Ratings::new(Store::new(Arc::new(db)).unwrap());
        let record = |bank_id: &str, value: u8| {
            ratings
                .store
                .bank_ratings
                .transaction(|tree| apply_in(tree, bank_id, rating(value)))
                .unwrap()
        };

        record("bank_a", 5);
        assert_eq!(record("bank_a", 3).count, 2);
        record("bank_b", 1);

        assert_eq!(ratings.get("bank_a").unwrap().average, dec!(4));
        assert_eq!(ratings.get("bank_b").unwrap().count, 1);
        assert_eq!(ratings.get("bank_c").unwrap(), RatingAggregate::default());
    }
}
