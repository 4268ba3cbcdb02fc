//! Configuration surface: route topology, timeline bounds, classifier
//! thresholds and the ordered rule list.
//!
//! Stored as a JSON object on disk; every section is optional and falls back
//! to [`Default`]:
//! ```json
//! {
//!   "route": { "route_id": "109", "direction_id": 1,
//!              "boarding_stop_id": "5483", "terminal_stop_id": "7412" },
//!   "thresholds": { "no_vehicle_minutes": 12, "stagnation_dwell_secs": 300 },
//!   "rules": [
//!     { "rule": "no_vehicle_by_threshold", "state": "BAD", "reason": "no vehicle assigned" },
//!     { "rule": "insufficient_evidence", "state": "RISKY", "reason": "insufficient data" }
//!   ]
//! }
//! ```
//! Threshold defaults are placeholders to make the binary runnable; they have
//! not been tuned against collected data.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::classifier::{Rule, RuleKind, default_rules};
use crate::model::ConfidenceState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("rule list is empty")]
    EmptyRules,
    #[error("rule `{0}` appears more than once")]
    DuplicateRule(RuleKind),
    #[error("rule `{0}` cannot yield GOOD: only corroborated rules may")]
    UncorroboratedGood(RuleKind),
    #[error("invalid value for `{field}`: {detail}")]
    InvalidValue { field: &'static str, detail: String },
}

/// The single route/direction this deployment watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub route_id: String,
    pub direction_id: u8,
    pub boarding_stop_id: String,
    /// Stop where the preceding run finishes and the next one starts.
    pub terminal_stop_id: String,
    pub poll_interval_secs: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            route_id: "109".to_string(),
            direction_id: 1,
            boarding_stop_id: "5483".to_string(),
            terminal_stop_id: "7412".to_string(),
            poll_interval_secs: 30,
        }
    }
}

/// Bounds on the reconstructed timelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    pub max_entries_per_trip: usize,
    pub retention_secs: i64,
    pub lateness_window_secs: i64,
}

impl TimelineConfig {
    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_secs)
    }

    pub fn lateness_window(&self) -> Duration {
        Duration::seconds(self.lateness_window_secs)
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            max_entries_per_trip: 512,
            retention_secs: 3 * 3600,
            lateness_window_secs: 600,
        }
    }
}

/// Inputs to signal extraction and rule predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// "No vehicle assigned by T-minus" escalation, in minutes before departure.
    pub no_vehicle_minutes: f64,
    /// How long before scheduled departure the assignment window opens.
    pub assignment_window_secs: i64,
    /// Assignment delay beyond which an assignment counts as late.
    pub late_assignment_secs: i64,
    /// Trailing window for ETA drift.
    pub drift_window_secs: i64,
    /// Absolute drift considered unstable.
    pub high_drift_secs: i64,
    /// Absolute drift still considered stable enough for GOOD.
    pub stable_drift_secs: i64,
    pub stagnation_dwell_secs: i64,
    pub stagnation_min_polls: usize,
    /// Age of the newest successful poll beyond which data is stale.
    pub stale_data_secs: i64,
    /// Trailing window for counting error polls.
    pub gap_window_secs: i64,
    pub max_gaps_in_window: usize,
    /// Prior run reaching the terminal this long after our departure is late.
    pub prior_trip_late_secs: i64,
}

impl Thresholds {
    pub fn assignment_window(&self) -> Duration {
        Duration::seconds(self.assignment_window_secs)
    }

    pub fn drift_window(&self) -> Duration {
        Duration::seconds(self.drift_window_secs)
    }

    pub fn gap_window(&self) -> Duration {
        Duration::seconds(self.gap_window_secs)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            no_vehicle_minutes: 12.0,
            assignment_window_secs: 30 * 60,
            late_assignment_secs: 15 * 60,
            drift_window_secs: 15 * 60,
            high_drift_secs: 180,
            stable_drift_secs: 90,
            stagnation_dwell_secs: 300,
            stagnation_min_polls: 3,
            stale_data_secs: 120,
            gap_window_secs: 10 * 60,
            max_gaps_in_window: 2,
            prior_trip_late_secs: 120,
        }
    }
}

/// Presentation-order policy handed to the display layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Departures closer than this many minutes rank by confidence first.
    pub tie_epsilon_minutes: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            tie_epsilon_minutes: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub route: RouteConfig,
    pub timeline: TimelineConfig,
    pub thresholds: Thresholds,
    pub ranking: RankingConfig,
    pub rules: Vec<Rule>,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            route: RouteConfig::default(),
            timeline: TimelineConfig::default(),
            thresholds: Thresholds::default(),
            ranking: RankingConfig::default(),
            rules: default_rules(),
        }
    }
}

impl ConfidenceConfig {
    /// Loads and validates the config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would make classification untrustworthy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.is_empty() {
            return Err(ConfigError::EmptyRules);
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.rule) {
                return Err(ConfigError::DuplicateRule(rule.rule));
            }
            if rule.state == ConfidenceState::Good && !rule.rule.is_corroborating() {
                return Err(ConfigError::UncorroboratedGood(rule.rule));
            }
        }

        let t = &self.thresholds;
        if t.stable_drift_secs > t.high_drift_secs {
            return Err(ConfigError::InvalidValue {
                field: "thresholds.stable_drift_secs",
                detail: format!(
                    "{} exceeds high_drift_secs {}",
                    t.stable_drift_secs, t.high_drift_secs
                ),
            });
        }
        if t.stagnation_min_polls < 2 {
            return Err(ConfigError::InvalidValue {
                field: "thresholds.stagnation_min_polls",
                detail: "must be at least 2".to_string(),
            });
        }
        if self.timeline.max_entries_per_trip == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeline.max_entries_per_trip",
                detail: "must be positive".to_string(),
            });
        }
        if self.ranking.tie_epsilon_minutes < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "ranking.tie_epsilon_minutes",
                detail: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}
