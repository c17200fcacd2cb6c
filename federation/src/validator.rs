//! Field level validation of exposure keys.
//!
//! The same rules apply to keys accepted from mobile submissions, keys
//! downloaded from partner backends and keys uploaded to the gateway, so a
//! single `KeyValidator` is built at startup and shared by reference.

use crate::metrics_defs::KEY_VALIDATION_FAILED;
use crate::types::KeyFields;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use shared::counter;

/// Length of one rolling interval.
pub const ROLLING_INTERVAL_SECS: i64 = 600;
/// One full day of rolling intervals.
pub const MAX_ROLLING_PERIOD: i32 = 144;
pub const MAX_TRANSMISSION_RISK_LEVEL: i32 = 7;
/// Decoded key payloads must be strictly shorter than this.
pub const MAX_KEY_BYTES: usize = 32;
pub const DEFAULT_MAX_KEY_AGE_DAYS: u32 = 14;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Keys whose validity window ended more than this many days before now are rejected.
    #[serde(default = "default_max_key_age_days")]
    pub max_key_age_days: u32,
}

fn default_max_key_age_days() -> u32 {
    DEFAULT_MAX_KEY_AGE_DAYS
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            max_key_age_days: DEFAULT_MAX_KEY_AGE_DAYS,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("key is not valid base64 or decodes to 32 bytes or more")]
    MalformedKey,

    #[error(
        "rolling start number {rolling_start_number} with period {rolling_period} is outside the accepted window"
    )]
    RollingStartNumber {
        rolling_start_number: i64,
        rolling_period: i32,
    },

    #[error("rolling period {0} is outside 1..=144")]
    RollingPeriod(i32),

    #[error("transmission risk level {0} is outside 0..=7")]
    TransmissionRiskLevel(i32),
}

impl ValidationFailure {
    pub const fn reason(&self) -> &'static str {
        match self {
            ValidationFailure::MalformedKey => "malformed_key",
            ValidationFailure::RollingStartNumber { .. } => "rolling_start_number",
            ValidationFailure::RollingPeriod(_) => "rolling_period",
            ValidationFailure::TransmissionRiskLevel(_) => "transmission_risk_level",
        }
    }
}

/// Converts a timestamp to its rolling interval number.
pub fn interval_number(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(ROLLING_INTERVAL_SECS)
}

#[derive(Clone, Debug)]
pub struct KeyValidator {
    max_key_age: Duration,
}

impl KeyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        KeyValidator {
            max_key_age: Duration::days(i64::from(config.max_key_age_days)),
        }
    }

    pub fn is_key_well_formed(&self, key: &str) -> bool {
        STANDARD
            .decode(key)
            .map(|decoded| decoded.len() < MAX_KEY_BYTES)
            .unwrap_or(false)
    }

    /// The key must have started no later than the current interval, and its
    /// validity window must reach into the last `max_key_age`.
    pub fn is_rolling_start_number_valid(
        &self,
        now: DateTime<Utc>,
        rolling_start_number: i64,
        rolling_period: i32,
    ) -> bool {
        let current = interval_number(now);
        let expiry = now
            .checked_sub_signed(self.max_key_age)
            .map_or(i64::MIN, interval_number);
        rolling_start_number.saturating_add(i64::from(rolling_period)) >= expiry
            && rolling_start_number <= current
    }

    pub fn is_rolling_period_valid(&self, rolling_period: i32) -> bool {
        (1..=MAX_ROLLING_PERIOD).contains(&rolling_period)
    }

    pub fn is_transmission_risk_level_valid(&self, transmission_risk_level: i32) -> bool {
        (0..=MAX_TRANSMISSION_RISK_LEVEL).contains(&transmission_risk_level)
    }

    /// Returns the first rule the key breaks. Does not emit anything.
    pub fn validate(&self, now: DateTime<Utc>, fields: KeyFields<'_>) -> Result<(), ValidationFailure> {
        if !self.is_key_well_formed(fields.key) {
            return Err(ValidationFailure::MalformedKey);
        }
        if !self.is_rolling_start_number_valid(
            now,
            fields.rolling_start_number,
            fields.rolling_period,
        ) {
            return Err(ValidationFailure::RollingStartNumber {
                rolling_start_number: fields.rolling_start_number,
                rolling_period: fields.rolling_period,
            });
        }
        if !self.is_rolling_period_valid(fields.rolling_period) {
            return Err(ValidationFailure::RollingPeriod(fields.rolling_period));
        }
        if !self.is_transmission_risk_level_valid(fields.transmission_risk_level) {
            return Err(ValidationFailure::TransmissionRiskLevel(
                fields.transmission_risk_level,
            ));
        }
        Ok(())
    }

    /// Like `validate`, but records a diagnostic event and counter for a rejected key.
    pub fn check(&self, now: DateTime<Utc>, fields: KeyFields<'_>) -> bool {
        match self.validate(now, fields) {
            Ok(()) => true,
            Err(failure) => {
                tracing::debug!(reason = failure.reason(), "{failure}");
                counter!(KEY_VALIDATION_FAILED, "reason" => failure.reason()).increment(1);
                false
            }
        }
    }
}

impl Default for KeyValidator {
    fn default() -> Self {
        KeyValidator::new(ValidatorConfig::default())
    }
}
