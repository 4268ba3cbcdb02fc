//! Confidence records: the only shape the display layer ever sees.
//!
//! Supports ranking, JSON-lines and pretty output, and CSV append.

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::classifier::Classification;
use crate::model::{ConfidenceState, TripId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceRecord {
    pub trip_id: TripId,
    pub minutes_until_departure: f64,
    pub confidence_state: ConfidenceState,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

impl ConfidenceRecord {
    pub fn new(
        trip_id: impl Into<TripId>,
        minutes_until_departure: f64,
        classification: &Classification,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trip_id: trip_id.into(),
            minutes_until_departure,
            confidence_state: classification.state,
            reason: classification.reason.clone(),
            evaluated_at,
        }
    }
}

/// Orders records for presentation: soonest first, except that departures
/// within `epsilon_minutes` of the head of their group rank by confidence.
///
/// Grouping is anchored on the first record of each group so the result is a
/// deterministic total order even though "within epsilon" is not transitive.
pub fn rank_records(mut records: Vec<ConfidenceRecord>, epsilon_minutes: f64) -> Vec<ConfidenceRecord> {
    records.sort_by(|a, b| {
        a.minutes_until_departure
            .total_cmp(&b.minutes_until_departure)
            .then_with(|| a.trip_id.cmp(&b.trip_id))
    });

    let mut ranked = Vec::with_capacity(records.len());
    let mut group: Vec<ConfidenceRecord> = Vec::new();

    for record in records {
        let starts_new_group = group.first().is_some_and(|head| {
            record.minutes_until_departure - head.minutes_until_departure > epsilon_minutes
        });
        if starts_new_group {
            flush_group(&mut group, &mut ranked);
        }
        group.push(record);
    }
    flush_group(&mut group, &mut ranked);

    ranked
}

fn flush_group(group: &mut Vec<ConfidenceRecord>, ranked: &mut Vec<ConfidenceRecord>) {
    // stable: equal confidence keeps ETA order
    group.sort_by(|a, b| b.confidence_state.cmp(&a.confidence_state));
    ranked.append(group);
}

/// Logs records using Rust's debug pretty-print format.
pub fn print_pretty(records: &[ConfidenceRecord]) {
    for record in records {
        debug!("{:#?}", record);
    }
}

/// Writes records as a single pretty-printed JSON array.
pub fn write_json_pretty<W: Write>(mut writer: W, records: &[ConfidenceRecord]) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Writes one JSON object per record, newline-terminated.
pub fn write_json_lines<W: Write>(mut writer: W, records: &[ConfidenceRecord]) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Appends records as rows to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_records(path: &str, records: &[ConfidenceRecord]) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, rows = records.len(), "Appending CSV records");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    Ok(())
}
