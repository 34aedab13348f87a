//! Valuation of processed waste: gross value, platform fee and net payout
use super::error::{Error, Result};
use super::types::Fixed;
use rust_decimal::{Decimal, RoundingStrategy};

/// Price and fee policy in force when a submission is valued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tariff {
    pub price_per_kg: Decimal,
    pub fee_rate: Decimal,
    /// Decimal places of the currency's minor unit.
    pub scale: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Valuation {
    pub gross: Fixed,
    pub fee: Fixed,
    pub payout: Fixed,
}

impl Tariff {
    pub fn new(price_per_kg: Decimal, fee_rate: Decimal, scale: u32) -> Self {
        Self {
            price_per_kg,
            fee_rate,
            scale,
        }
    }

    /// Value of `weight` at this tariff, without any fee.
    pub fn estimate(&self, weight: Decimal) -> Result<Fixed> {
        Ok(self.gross(weight)?.into())
    }

    /// Split the value of `weight` into fee and payout. The fee absorbs any
    /// rounding remainder, so `fee + payout == gross` always holds.
    pub fn value(&self, weight: Decimal) -> Result<Valuation> {
        let gross = self.gross(weight)?;
        let fee = gross
            .checked_mul(self.fee_rate)
            .map(|fee| round_half_up(fee, self.scale))
            .ok_or_else(|| Error::InvalidWeight(format!("fee on {gross} overflows")))?;
        let payout = gross - fee;

        Ok(Valuation {
            gross: gross.into(),
            fee: fee.into(),
            payout: payout.into(),
        })
    }

    fn gross(&self, weight: Decimal) -> Result<Decimal> {
        weight
            .checked_mul(self.price_per_kg)
            .map(|gross| round_half_up(gross, self.scale))
            .ok_or_else(|| Error::InvalidWeight(format!("{weight} kg at {} per kg overflows", self.price_per_kg)))
    }
}

pub fn round_half_up(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Deviation of `actual` from `declared`, as a percentage of `declared`.
pub fn weight_deviation_percentage(declared: Decimal, actual: Decimal) -> Result<Decimal> {
    if declared.is_zero() {
        return Ok(Decimal::ONE_HUNDRED);
    }
    actual
        .checked_sub(declared)
        .and_then(|diff| diff.abs().checked_div(declared))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map(|percentage| round_half_up(percentage, 2))
        .ok_or_else(|| Error::InvalidWeight(format!("{actual} cannot be compared with {declared}")))
}
