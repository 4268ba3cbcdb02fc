//! Core data model: poll events, the snapshots they carry, and the
//! confidence states the classifier produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TripId = String;

/// Coarse movement status of a vehicle as reported upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    InTransit,
    Stopped,
    #[default]
    Unknown,
}

impl VehicleStatus {
    /// Maps an upstream `current_status` string onto a [`VehicleStatus`].
    pub fn from_feed(raw: Option<&str>) -> Self {
        match raw {
            Some("IN_TRANSIT_TO") | Some("INCOMING_AT") => VehicleStatus::InTransit,
            Some("STOPPED_AT") => VehicleStatus::Stopped,
            _ => VehicleStatus::Unknown,
        }
    }
}

/// What the upstream system believed about one trip at one stop at `observed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictionSnapshot {
    pub trip_id: TripId,
    pub stop_id: String,
    pub direction: u8,
    pub stop_sequence: Option<u32>,
    pub predicted_arrival_time: Option<DateTime<Utc>>,
    pub predicted_departure_time: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub vehicle_id: Option<String>,
    pub schedule_relationship: Option<String>,
    pub polled_at: DateTime<Utc>,
}

impl PredictionSnapshot {
    /// Arrival if present, otherwise departure. Terminal-origin stops only
    /// carry a departure.
    pub fn best_time(&self) -> Option<DateTime<Utc>> {
        self.predicted_arrival_time.or(self.predicted_departure_time)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.schedule_relationship.as_deref(),
            Some("CANCELLED") | Some("SKIPPED")
        )
    }

    /// Equality ignoring `polled_at`: the same upstream fact re-delivered by a
    /// later poll is a duplicate, not a conflict.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.trip_id == other.trip_id
            && self.stop_id == other.stop_id
            && self.direction == other.direction
            && self.stop_sequence == other.stop_sequence
            && self.predicted_arrival_time == other.predicted_arrival_time
            && self.predicted_departure_time == other.predicted_departure_time
            && self.observed_at == other.observed_at
            && self.vehicle_id == other.vehicle_id
            && self.schedule_relationship == other.schedule_relationship
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VehiclePosition {
    pub trip_id: Option<TripId>,
    pub vehicle_id: Option<String>,
    pub current_stop_id: Option<String>,
    pub current_stop_sequence: Option<u32>,
    pub status: VehicleStatus,
    pub observed_at: DateTime<Utc>,
    pub polled_at: DateTime<Utc>,
}

impl VehiclePosition {
    /// Identifies "where the vehicle is" for stagnation checks: the stop id
    /// when reported, otherwise the stop sequence.
    pub fn stop_marker(&self) -> Option<String> {
        match (&self.current_stop_id, self.current_stop_sequence) {
            (Some(stop), _) => Some(stop.clone()),
            (None, Some(seq)) => Some(format!("seq:{seq}")),
            (None, None) => None,
        }
    }

    pub fn same_payload(&self, other: &Self) -> bool {
        self.trip_id == other.trip_id
            && self.vehicle_id == other.vehicle_id
            && self.current_stop_id == other.current_stop_id
            && self.current_stop_sequence == other.current_stop_sequence
            && self.status == other.status
            && self.observed_at == other.observed_at
    }
}

/// One fetch cycle against the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollEvent {
    pub poll_timestamp: DateTime<Utc>,
    pub predictions: Vec<PredictionSnapshot>,
    pub vehicles: Vec<VehiclePosition>,
    pub error: Option<String>,
}

impl PollEvent {
    pub fn new(poll_timestamp: DateTime<Utc>) -> Self {
        Self {
            poll_timestamp,
            predictions: Vec::new(),
            vehicles: Vec::new(),
            error: None,
        }
    }

    pub fn failed(poll_timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(poll_timestamp)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The collapsed judgment about a trip's trustworthiness.
///
/// Ordered from least to most trustworthy so `max` picks the better trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceState {
    Bad,
    Risky,
    Good,
}

impl fmt::Display for ConfidenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfidenceState::Good => "GOOD",
            ConfidenceState::Risky => "RISKY",
            ConfidenceState::Bad => "BAD",
        };
        f.write_str(s)
    }
}
