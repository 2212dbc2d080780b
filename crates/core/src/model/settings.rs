use chrono::Duration;
use std::env;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettingsError {
    #[error("autosave interval must be > 0 seconds")]
    InvalidAutosaveInterval,

    #[error("staleness threshold must be > 0 seconds")]
    InvalidStalenessThreshold,

    #[error("tick cadence must be > 0 seconds")]
    InvalidTickCadence,

    #[error("background jump bound must be greater than the tick cadence")]
    InvalidBackgroundBound,

    #[error("warning thresholds must be > 0 minutes")]
    InvalidWarningThreshold,

    #[error("invalid value for {name}: {raw}")]
    InvalidEnv { name: &'static str, raw: String },
}

/// Tunables for the attempt session layer.
///
/// The autosave interval and staleness threshold are product choices, not
/// backend contracts, so both are configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    autosave_interval_secs: u32,
    staleness_threshold_secs: u32,
    tick_cadence_secs: u32,
    background_jump_secs: u32,
    warning_minutes: Vec<u32>,
    list_cache_ttl_secs: u32,
}

impl SessionSettings {
    /// Defaults used by the exam screens:
    /// - autosave every 30 seconds while dirty
    /// - attempts idle for 24 hours read as expired
    /// - 1 Hz timer; jumps over 5 seconds are treated as a return from background
    /// - warnings at 30, 15, 5 and 1 minutes left
    /// - attempt lists cached for 60 seconds
    #[must_use]
    pub fn default_for_exam() -> Self {
        Self {
            autosave_interval_secs: 30,
            staleness_threshold_secs: 24 * 60 * 60,
            tick_cadence_secs: 1,
            background_jump_secs: 5,
            warning_minutes: vec![30, 15, 5, 1],
            list_cache_ttl_secs: 60,
        }
    }

    /// Creates custom settings. Warning thresholds are deduplicated and sorted
    /// from the earliest (largest) to the most urgent.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` if any duration is zero or the background bound
    /// does not exceed the tick cadence.
    pub fn new(
        autosave_interval_secs: u32,
        staleness_threshold_secs: u32,
        tick_cadence_secs: u32,
        background_jump_secs: u32,
        mut warning_minutes: Vec<u32>,
        list_cache_ttl_secs: u32,
    ) -> Result<Self, SettingsError> {
        if autosave_interval_secs == 0 {
            return Err(SettingsError::InvalidAutosaveInterval);
        }
        if staleness_threshold_secs == 0 {
            return Err(SettingsError::InvalidStalenessThreshold);
        }
        if tick_cadence_secs == 0 {
            return Err(SettingsError::InvalidTickCadence);
        }
        if background_jump_secs <= tick_cadence_secs {
            return Err(SettingsError::InvalidBackgroundBound);
        }
        if warning_minutes.contains(&0) {
            return Err(SettingsError::InvalidWarningThreshold);
        }
        warning_minutes.sort_unstable_by(|a, b| b.cmp(a));
        warning_minutes.dedup();

        Ok(Self {
            autosave_interval_secs,
            staleness_threshold_secs,
            tick_cadence_secs,
            background_jump_secs,
            warning_minutes,
            list_cache_ttl_secs,
        })
    }

    /// Defaults overridden by `EXAM_AUTOSAVE_SECS`, `EXAM_STALENESS_HOURS`,
    /// `EXAM_WARNING_MINUTES` (comma separated) and `EXAM_LIST_CACHE_SECS`.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::InvalidEnv` for unparsable values and the usual
    /// validation errors otherwise.
    pub fn from_env() -> Result<Self, SettingsError> {
        let defaults = Self::default_for_exam();
        let autosave = env_u32("EXAM_AUTOSAVE_SECS")?.unwrap_or(defaults.autosave_interval_secs);
        let staleness = env_u32("EXAM_STALENESS_HOURS")?
            .map_or(defaults.staleness_threshold_secs, |h| h.saturating_mul(3600));
        let cache_ttl = env_u32("EXAM_LIST_CACHE_SECS")?.unwrap_or(defaults.list_cache_ttl_secs);
        let warnings = match env::var("EXAM_WARNING_MINUTES") {
            Ok(raw) => parse_minutes(&raw)?,
            Err(_) => defaults.warning_minutes.clone(),
        };

        Self::new(
            autosave,
            staleness,
            defaults.tick_cadence_secs,
            defaults.background_jump_secs,
            warnings,
            cache_ttl,
        )
    }

    #[must_use]
    pub fn autosave_interval(&self) -> Duration {
        Duration::seconds(i64::from(self.autosave_interval_secs))
    }

    #[must_use]
    pub fn staleness_threshold(&self) -> Duration {
        Duration::seconds(i64::from(self.staleness_threshold_secs))
    }

    #[must_use]
    pub fn tick_cadence_secs(&self) -> u32 {
        self.tick_cadence_secs
    }

    #[must_use]
    pub fn background_jump_secs(&self) -> u32 {
        self.background_jump_secs
    }

    /// Warning thresholds in minutes, largest first.
    #[must_use]
    pub fn warning_minutes(&self) -> &[u32] {
        &self.warning_minutes
    }

    #[must_use]
    pub fn list_cache_ttl(&self) -> Duration {
        Duration::seconds(i64::from(self.list_cache_ttl_secs))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::default_for_exam()
    }
}

fn env_u32(name: &'static str) -> Result<Option<u32>, SettingsError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SettingsError::InvalidEnv { name, raw }),
        Err(_) => Ok(None),
    }
}

fn parse_minutes(raw: &str) -> Result<Vec<u32>, SettingsError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| SettingsError::InvalidEnv {
                name: "EXAM_WARNING_MINUTES",
                raw: raw.to_string(),
            })
        })
        .collect()
}
