//! Turns raw log records into [`PollEvent`]s.
//!
//! Two layouts are understood:
//! - three separate streams (predictions, vehicles, errors), one record per
//!   line, correlated by `poll_timestamp`;
//! - the collector's combined log, one poll per line with boarding and
//!   terminal predictions plus the fleet.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::RouteConfig;
use crate::model::{PollEvent, PredictionSnapshot, VehiclePosition, VehicleStatus};

/// A line of the prediction stream.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionLine {
    pub poll_timestamp: DateTime<Utc>,
    pub trip_id: String,
    pub stop_id: String,
    pub direction: Option<u8>,
    pub stop_sequence: Option<u32>,
    pub predicted_arrival_time: Option<DateTime<Utc>>,
    pub predicted_departure_time: Option<DateTime<Utc>>,
    pub observed_at: Option<DateTime<Utc>>,
    pub vehicle_id: Option<String>,
    pub schedule_relationship: Option<String>,
}

impl PredictionLine {
    fn into_snapshot(self, default_direction: u8) -> PredictionSnapshot {
        PredictionSnapshot {
            trip_id: self.trip_id,
            stop_id: self.stop_id,
            direction: self.direction.unwrap_or(default_direction),
            stop_sequence: self.stop_sequence,
            predicted_arrival_time: self.predicted_arrival_time,
            predicted_departure_time: self.predicted_departure_time,
            observed_at: self.observed_at.unwrap_or(self.poll_timestamp),
            vehicle_id: self.vehicle_id,
            schedule_relationship: self.schedule_relationship,
            polled_at: self.poll_timestamp,
        }
    }
}

/// A line of the vehicle-position stream.
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleLine {
    pub poll_timestamp: DateTime<Utc>,
    pub trip_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub current_stop_id: Option<String>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl VehicleLine {
    fn into_position(self) -> VehiclePosition {
        VehiclePosition {
            status: VehicleStatus::from_feed(self.current_status.as_deref()),
            trip_id: self.trip_id,
            vehicle_id: self.vehicle_id,
            current_stop_id: self.current_stop_id,
            current_stop_sequence: self.current_stop_sequence,
            observed_at: self.observed_at.unwrap_or(self.poll_timestamp),
            polled_at: self.poll_timestamp,
        }
    }
}

/// A line of the error stream.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorLine {
    pub poll_timestamp: DateTime<Utc>,
    pub error_description: String,
}

/// Records from the three streams, in whatever order they were read.
#[derive(Debug, Default)]
pub struct StreamBatch {
    pub predictions: Vec<PredictionLine>,
    pub vehicles: Vec<VehicleLine>,
    pub errors: Vec<ErrorLine>,
}

impl StreamBatch {
    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty() && self.vehicles.is_empty() && self.errors.is_empty()
    }

    /// Correlates records by `poll_timestamp` into one event per poll, oldest
    /// first. Predictions for other directions are dropped.
    pub fn into_events(self, route: &RouteConfig) -> Vec<PollEvent> {
        let mut polls: BTreeMap<DateTime<Utc>, PollEvent> = BTreeMap::new();
        let mut off_route = 0usize;

        for line in self.predictions {
            if line.direction.is_some_and(|d| d != route.direction_id) {
                off_route += 1;
                continue;
            }
            polls
                .entry(line.poll_timestamp)
                .or_insert_with(|| PollEvent::new(line.poll_timestamp))
                .predictions
                .push(line.into_snapshot(route.direction_id));
        }

        for line in self.vehicles {
            polls
                .entry(line.poll_timestamp)
                .or_insert_with(|| PollEvent::new(line.poll_timestamp))
                .vehicles
                .push(line.into_position());
        }

        for line in self.errors {
            let event = polls
                .entry(line.poll_timestamp)
                .or_insert_with(|| PollEvent::new(line.poll_timestamp));
            event.error = Some(line.error_description);
        }

        if off_route > 0 {
            debug!(off_route, "Dropped predictions for other directions");
        }
        polls.into_values().collect()
    }
}

/// One line of the collector's combined log.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorLine {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub boarding: StopPredictions,
    #[serde(default)]
    pub terminal: StopPredictions,
    #[serde(default)]
    pub fleet: Vec<FleetRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopPredictions {
    #[serde(default)]
    pub predictions: Vec<CollectorPrediction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorPrediction {
    pub trip_id: Option<String>,
    pub departure_time: Option<DateTime<Utc>>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub stop_sequence: Option<u32>,
    pub schedule_relationship: Option<String>,
    pub vehicle_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FleetRecord {
    pub vehicle_id: Option<String>,
    pub trip_id: Option<String>,
    pub direction_id: Option<u8>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CollectorLine {
    /// Converts the line into a poll event. Stop ids are not logged by the
    /// collector, so they come from the route configuration. A vehicle on the
    /// watched direction at its first stop is placed at the terminal.
    pub fn into_event(self, route: &RouteConfig) -> PollEvent {
        let ts = self.timestamp;
        if let Some(error) = self.error {
            return PollEvent::failed(ts, error);
        }

        let stops = [
            (&route.boarding_stop_id, self.boarding.predictions),
            (&route.terminal_stop_id, self.terminal.predictions),
        ];
        let predictions = stops
            .into_iter()
            .flat_map(|(stop_id, preds)| {
                preds.into_iter().filter_map(move |p| {
                    Some(PredictionSnapshot {
                        trip_id: p.trip_id?,
                        stop_id: stop_id.clone(),
                        direction: route.direction_id,
                        stop_sequence: p.stop_sequence,
                        predicted_arrival_time: p.arrival_time,
                        predicted_departure_time: p.departure_time,
                        observed_at: ts,
                        vehicle_id: p.vehicle_id,
                        schedule_relationship: p.schedule_relationship,
                        polled_at: ts,
                    })
                })
            })
            .collect();

        let vehicles = self
            .fleet
            .into_iter()
            .map(|v| VehiclePosition {
                current_stop_id: (v.direction_id == Some(route.direction_id)
                    && v.current_stop_sequence.is_some_and(|seq| seq <= 1))
                .then(|| route.terminal_stop_id.clone()),
                status: VehicleStatus::from_feed(v.current_status.as_deref()),
                trip_id: v.trip_id,
                vehicle_id: v.vehicle_id,
                current_stop_sequence: v.current_stop_sequence,
                observed_at: v.updated_at.unwrap_or(ts),
                polled_at: ts,
            })
            .collect();

        PollEvent {
            poll_timestamp: ts,
            predictions,
            vehicles,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_lines;
    use chrono::TimeZone;

    fn route() -> RouteConfig {
        RouteConfig::default()
    }

    #[test]
    fn test_streams_are_correlated_by_poll_timestamp() {
        let predictions = br#"{"poll_timestamp":"2025-01-06T13:00:30Z","trip_id":"t1","stop_id":"5483","direction":1,"stop_sequence":10,"predicted_arrival_time":"2025-01-06T13:10:00Z","predicted_departure_time":null}
{"poll_timestamp":"2025-01-06T13:00:00Z","trip_id":"t1","stop_id":"5483","direction":1,"stop_sequence":10,"predicted_arrival_time":"2025-01-06T13:09:00Z","predicted_departure_time":null}
{"poll_timestamp":"2025-01-06T13:00:00Z","trip_id":"t9","stop_id":"5483","direction":0,"stop_sequence":3,"predicted_arrival_time":null,"predicted_departure_time":null}
"#;
        let vehicles = br#"{"poll_timestamp":"2025-01-06T13:00:00Z","trip_id":"t1","vehicle_id":"y1","current_stop_id":"7412","current_status":"STOPPED_AT"}
"#;
        let errors = br#"{"poll_timestamp":"2025-01-06T13:01:00Z","error_description":"HTTP 503"}
"#;
        let batch = StreamBatch {
            predictions: parse_lines(predictions).unwrap().records,
            vehicles: parse_lines(vehicles).unwrap().records,
            errors: parse_lines(errors).unwrap().records,
        };
        let events = batch.into_events(&route());

        assert_eq!(events.len(), 3);
        assert!(StreamBatch::default().is_empty());
        assert!(StreamBatch::default().into_events(&route()).is_empty());
        assert_eq!(
            events[0].poll_timestamp,
            Utc.with_ymd_and_hms(2025, 1, 6, 13, 0, 0).unwrap()
        );
        assert_eq!(events[0].predictions.len(), 1);
        assert_eq!(events[0].vehicles.len(), 1);
        assert_eq!(events[0].vehicles[0].status, VehicleStatus::Stopped);
        assert_eq!(events[0].predictions[0].observed_at, events[0].poll_timestamp);
        assert_eq!(events[1].predictions.len(), 1);
        assert_eq!(events[2].error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn test_collector_line_to_event() {
        let line = r#"{"timestamp":"2025-01-06T08:00:00-05:00",
            "boarding":{"predictions":[{"trip_id":"t1","departure_time":"2025-01-06T08:20:00-05:00","arrival_time":"2025-01-06T08:19:00-05:00","stop_sequence":10,"schedule_relationship":null,"vehicle_id":"y1"},
                                       {"trip_id":null,"departure_time":null,"arrival_time":null,"stop_sequence":10,"schedule_relationship":null,"vehicle_id":null}]},
            "terminal":{"predictions":[{"trip_id":"t2","departure_time":"2025-01-06T08:40:00-05:00","schedule_relationship":null,"stop_sequence":1}]},
            "fleet":[{"vehicle_id":"y1","trip_id":"t1","direction_id":1,"current_stop_sequence":7,"current_status":"IN_TRANSIT_TO","updated_at":"2025-01-06T07:59:50-05:00"}],
            "error":null}"#;
        let collector: CollectorLine = serde_json::from_str(line).unwrap();
        let event = collector.into_event(&route());

        assert_eq!(event.predictions.len(), 2);
        assert_eq!(event.predictions[0].stop_id, "5483");
        assert_eq!(event.predictions[0].vehicle_id.as_deref(), Some("y1"));
        assert_eq!(event.predictions[1].stop_id, "7412");
        assert_eq!(event.vehicles.len(), 1);
        assert_eq!(event.vehicles[0].status, VehicleStatus::InTransit);
        assert_eq!(event.vehicles[0].current_stop_id, None);
        assert_eq!(
            event.vehicles[0].observed_at,
            Utc.with_ymd_and_hms(2025, 1, 6, 12, 59, 50).unwrap()
        );
    }

    #[test]
    fn test_collector_vehicle_at_first_stop_is_at_terminal() {
        let line = r#"{"timestamp":"2025-01-06T08:00:00-05:00",
            "fleet":[{"vehicle_id":"y1","trip_id":"t1","direction_id":1,"current_stop_sequence":1,"current_status":"STOPPED_AT","updated_at":null},
                     {"vehicle_id":"y2","trip_id":"t0","direction_id":0,"current_stop_sequence":1,"current_status":"STOPPED_AT","updated_at":null}],
            "error":null}"#;
        let collector: CollectorLine = serde_json::from_str(line).unwrap();
        let event = collector.into_event(&route());
        assert_eq!(event.vehicles[0].current_stop_id.as_deref(), Some("7412"));
        assert_eq!(event.vehicles[1].current_stop_id, None);
    }

    #[test]
    fn test_collector_error_line_has_no_snapshots() {
        let line = r#"{"timestamp":"2025-01-06T13:00:00Z","boarding":{"predictions":[]},"terminal":{"predictions":[]},"fleet":[],"error":"HTTP 429"}"#;
        let collector: CollectorLine = serde_json::from_str(line).unwrap();
        let event = collector.into_event(&route());
        assert!(event.is_error());
        assert!(event.predictions.is_empty());
    }
}
