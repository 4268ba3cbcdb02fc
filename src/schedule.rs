//! Static schedule input: the scheduled departure of each trip at the
//! boarding stop.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::model::TripId;

/// A single row of the schedule CSV (`trip_id,scheduled_departure`).
#[derive(Debug, Deserialize)]
struct ScheduleRow {
    trip_id: TripId,
    scheduled_departure: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Schedule {
    departures: BTreeMap<TripId, DateTime<Utc>>,
}

impl Schedule {
    /// Reads a schedule from CSV bytes with a header row.
    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(bytes);
        let mut departures = BTreeMap::new();

        for (row, result) in rdr.deserialize().enumerate() {
            let record: ScheduleRow =
                result.with_context(|| format!("invalid schedule row {}", row + 1))?;
            departures.insert(record.trip_id, record.scheduled_departure);
        }

        debug!(trips = departures.len(), "Schedule loaded");
        Ok(Self { departures })
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, DateTime<Utc>)>,
        S: Into<TripId>,
    {
        Self {
            departures: pairs.into_iter().map(|(id, t)| (id.into(), t)).collect(),
        }
    }

    pub fn departure(&self, trip_id: &str) -> Option<DateTime<Utc>> {
        self.departures.get(trip_id).copied()
    }

    /// Trips scheduled to depart in `[from, to]`, in trip id order.
    pub fn departing_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = (&str, DateTime<Utc>)> {
        self.departures
            .iter()
            .filter(move |(_, d)| **d >= from && **d <= to)
            .map(|(id, d)| (id.as_str(), *d))
    }

    pub fn len(&self) -> usize {
        self.departures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.departures.is_empty()
    }
}
