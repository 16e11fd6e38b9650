//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{protocol::Combination, selector::SelectionStrategy};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub selection: SelectionSettings,
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub heartbeat: HeartbeatSettings,
    #[validate]
    pub mask: MaskSettings,
    #[validate]
    pub model: ModelSettings,
    #[validate]
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default)]
    pub redis: Option<RedisSettings>,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("xaynet").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// The reconstruction threshold, which defaults to the minimum cohort size.
    pub fn threshold(&self) -> usize {
        self.mask.threshold.unwrap_or(self.selection.min_cohort)
    }
}

/// Checks the invariants spanning several sections.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    let threshold = s.threshold();
    if threshold == 0 || threshold > s.selection.min_cohort {
        return Err(ValidationError::new("invalid reconstruction threshold"));
    }
    Ok(())
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_selection"))]
/// Cohort selection settings.
pub struct SelectionSettings {
    /// The minimal cohort size. A round is not started below this size and a running round is
    /// abandoned once it can no longer reach it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [selection]
    /// min_cohort = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_SELECTION__MIN_COHORT=3
    /// ```
    #[validate(range(min = 1))]
    pub min_cohort: usize,
    /// The desired cohort size. Must be greater or equal to `min_cohort`.
    pub target_cohort: usize,
    /// The selection strategy, either `uniform_random` or `round_robin_fair`.
    pub strategy: SelectionStrategy,
    /// Participants are eligible if they heartbeated within this many seconds.
    #[validate(range(min = 1))]
    pub liveness_window: u64,
    /// The seed from which the per-round selection seeds are derived.
    #[serde(default)]
    pub seed: u64,
}

fn validate_selection(s: &SelectionSettings) -> Result<(), ValidationError> {
    if s.min_cohort <= s.target_cohort {
        Ok(())
    } else {
        Err(ValidationError::new("invalid cohort size range"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round timing settings. All values are in seconds.
pub struct RoundSettings {
    /// If set, a new round is attempted this many seconds after the coordinator became idle.
    /// Otherwise rounds only start on request.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// interval = 60
    /// ```
    #[serde(default)]
    pub interval: Option<u64>,
    /// The time the cohort has to submit its key material.
    #[validate(range(min = 1))]
    pub key_exchange_timeout: u64,
    /// The time the cohort has to submit its masked updates, counted from the start of the
    /// collection.
    #[validate(range(min = 1))]
    pub collect_timeout: u64,
    /// The time the survivors have to submit their dropout shares.
    #[validate(range(min = 1))]
    pub aggregate_timeout: u64,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_heartbeat"))]
/// Liveness settings. All values are in seconds.
pub struct HeartbeatSettings {
    /// A participant in a round is dropped if it did not heartbeat for this long.
    #[validate(range(min = 1))]
    pub timeout: u64,
    /// The period of the liveness scan. It bounds the detection latency of a dropout.
    #[validate(range(min = 1))]
    pub period: u64,
    /// Participants outside of a round are removed after this long without a heartbeat.
    #[validate(range(min = 1))]
    pub eviction: u64,
}

fn validate_heartbeat(s: &HeartbeatSettings) -> Result<(), ValidationError> {
    if s.period <= s.timeout && s.timeout <= s.eviction {
        Ok(())
    } else {
        Err(ValidationError::new("invalid heartbeat time range(s)"))
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Masking settings.
pub struct MaskSettings {
    /// The number of dropout shares needed to reconstruct the secret of a dropped participant.
    /// Defaults to the minimal cohort size and must not exceed it.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [mask]
    /// threshold = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_MASK__THRESHOLD=3
    /// ```
    #[serde(default)]
    pub threshold: Option<usize>,
    /// The number of fractional bits of the fixed point encoding of the updates.
    #[validate(range(min = 1, max = 48))]
    pub fractional_bits: u32,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Model settings.
pub struct ModelSettings {
    /// The number of elements of a model update.
    #[validate(range(min = 1))]
    pub length: usize,
    /// How the unmasked sum is turned into the round result: `mean`, `sum` or `weighted_mean`.
    #[serde(default)]
    pub combination: Combination,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_persistence"))]
/// Retry settings for checkpoint and result writes.
pub struct PersistenceSettings {
    /// The maximal number of attempts of a write.
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// The backoff after the first failed attempt, in milliseconds. It doubles after every
    /// further failure.
    pub initial_backoff: u64,
    /// The upper bound of the backoff, in milliseconds.
    pub max_backoff: u64,
    /// The time a single attempt may take, in milliseconds.
    #[validate(range(min = 1))]
    pub attempt_timeout: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: 100,
            max_backoff: 5_000,
            attempt_timeout: 2_000,
        }
    }
}

fn validate_persistence(s: &PersistenceSettings) -> Result<(), ValidationError> {
    if s.initial_backoff <= s.max_backoff {
        Ok(())
    } else {
        Err(ValidationError::new("invalid backoff range"))
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Redis settings.
pub struct RedisSettings {
    /// The URL where Redis is running.
    ///
    /// The format of the URL is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [redis]
    /// url = "redis://127.0.0.1/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_REDIS__URL=redis://127.0.0.1/
    /// ```
    pub url: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn settings() -> Settings {
        Settings {
            selection: SelectionSettings {
                min_cohort: 3,
                target_cohort: 4,
                strategy: SelectionStrategy::UniformRandom,
                liveness_window: 30,
                seed: 42,
            },
            round: RoundSettings {
                interval: None,
                key_exchange_timeout: 10,
                collect_timeout: 60,
                aggregate_timeout: 10,
            },
            heartbeat: HeartbeatSettings {
                timeout: 15,
                period: 1,
                eviction: 3600,
            },
            mask: MaskSettings {
                threshold: None,
                fractional_bits: 24,
            },
            model: ModelSettings {
                length: 4,
                combination: Combination::Mean,
            },
            persistence: PersistenceSettings::default(),
            redis: None,
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new("configs/config.toml").is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(settings().validate().is_ok());
        assert_eq!(settings().threshold(), 3);
    }

    #[test]
    fn test_validate_cohort_range() {
        let mut s = settings();
        s.selection.target_cohort = 2;
        assert!(s.validate().is_err());

        let mut s = settings();
        s.selection.min_cohort = 0;
        s.selection.target_cohort = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_threshold() {
        let mut s = settings();
        s.mask.threshold = Some(4);
        assert!(s.validate().is_err());

        s.mask.threshold = Some(0);
        assert!(s.validate().is_err());

        s.mask.threshold = Some(2);
        assert!(s.validate().is_ok());
        assert_eq!(s.threshold(), 2);
    }

    #[test]
    fn test_validate_heartbeat() {
        let mut s = settings();
        s.heartbeat.period = 20;
        assert!(s.validate().is_err());

        let mut s = settings();
        s.heartbeat.eviction = 10;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_validate_fractional_bits() {
        let mut s = settings();
        s.mask.fractional_bits = 60;
        assert!(s.validate().is_err());
    }
}
