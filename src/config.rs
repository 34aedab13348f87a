//! Policy configuration.
//!
//! Values come from, in increasing priority:
//! 1. built-in defaults (mirroring the platform's seeded settings),
//! 2. `recycle.yaml` in the working directory, if present,
//! 3. the file passed to [`Settings::load`] or named by `RECYCLE_CONFIG`,
//! 4. `RECYCLE__*` environment variables, e.g. `RECYCLE__FEE_RATE=0.08`.

use anyhow::{Context, ensure};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "recycle.yaml";
/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "RECYCLE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RECYCLE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of the sled database.
    pub storage_path: String,
    /// Share of the gross value kept by the platform, in `[0, 1)`.
    pub fee_rate: Decimal,
    pub min_submission_weight: Decimal,
    pub max_submission_weight: Decimal,
    /// Heaviest actual weight a `processed` transition accepts.
    pub max_processed_weight: Decimal,
    /// Percentage deviation between declared and actual weight that should be flagged.
    pub weight_tolerance_percentage: Decimal,
    pub min_withdrawal_amount: Decimal,
    pub max_withdrawal_amount: Decimal,
    pub max_photos_per_submission: usize,
    /// Decimal places of the currency's minor unit.
    pub currency_scale: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_path: "data/recycle.sled".to_string(),
            fee_rate: Decimal::new(10, 2),
            min_submission_weight: Decimal::new(1, 1),
            max_submission_weight: Decimal::from(100),
            max_processed_weight: Decimal::from(1_000),
            weight_tolerance_percentage: Decimal::from(20),
            min_withdrawal_amount: Decimal::from(50_000),
            max_withdrawal_amount: Decimal::from(1_000_000),
            max_photos_per_submission: 5,
            currency_scale: 2,
        }
    }
}

impl Settings {
    /// Load settings from files and environment, then validate them.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("failed to read configuration sources")?
            .try_deserialize()
            .context("configuration does not match the settings schema")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.fee_rate >= Decimal::ZERO && self.fee_rate < Decimal::ONE,
            "fee_rate must be in [0, 1), got {}",
            self.fee_rate
        );
        ensure!(
            self.min_submission_weight >= Decimal::ZERO
                && self.min_submission_weight <= self.max_submission_weight,
            "submission weight bounds are inverted"
        );
        ensure!(
            self.max_submission_weight > Decimal::ZERO,
            "max_submission_weight must be positive"
        );
        ensure!(
            self.max_processed_weight >= self.max_submission_weight,
            "max_processed_weight must be at least max_submission_weight"
        );
        ensure!(
            self.min_withdrawal_amount >= Decimal::ZERO
                && self.min_withdrawal_amount <= self.max_withdrawal_amount,
            "withdrawal bounds are inverted"
        );
        ensure!(
            self.weight_tolerance_percentage >= Decimal::ZERO,
            "weight_tolerance_percentage must not be negative"
        );
        ensure!(self.currency_scale <= 4, "currency_scale above 4 is not supported");
        Ok(())
    }

    /// Whether `weight` is acceptable as a declared weight.
    pub fn accepts_weight(&self, weight: Decimal) -> bool {
        weight > Decimal::ZERO
            && weight >= self.min_submission_weight
            && weight <= self.max_submission_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.fee_rate, dec!(0.10));
        assert_eq!(settings.min_withdrawal_amount, dec!(50000));
    }

    #[test]
    fn rejects_fee_rate_of_one() {
        let settings = Settings {
            fee_rate: dec!(1),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn weight_bounds() {
        let settings = Settings::default();
        assert!(!settings.accepts_weight(dec!(0)));
        assert!(!settings.accepts_weight(dec!(0.05)));
        assert!(settings.accepts_weight(dec!(0.1)));
        assert!(settings.accepts_weight(dec!(100)));
        assert!(!settings.accepts_weight(dec!(100.01)));
    }

    #[test]
    fn processed_weight_cap_covers_declared_weights() {
        assert_eq!(Settings::default().max_processed_weight, dec!(1000));
        let settings = Settings {
            max_processed_weight: dec!(50),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
