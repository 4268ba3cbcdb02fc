//! Signal extraction.
//!
//! Every signal is a pure function of a trip's timeline as of the evaluation
//! instant. Missing inputs produce [`Signal::Unknown`] with the reason they are
//! missing; nothing is defaulted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::config::{RouteConfig, Thresholds};
use crate::model::{TripId, VehiclePosition, VehicleStatus};
use crate::timeline::{Assignment, TimelineEntry, TimelineStore, Trip, within};

/// Why a signal could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Missing {
    NoSchedule,
    Unassigned,
    NoPredictions,
    TooFewPredictions,
    NoPositions,
    NoStopReported,
    NoPriorTrip,
    NoPriorArrival,
    NoDepartureReference,
    NoSuccessfulPoll,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Signal<T> {
    Known(T),
    Unknown(Missing),
}

impl<T> Signal<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Signal::Known(v) => Some(v),
            Signal::Unknown(_) => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Signal::Known(_))
    }

    /// True if the value is known and satisfies `f`.
    pub fn is_known_and(&self, f: impl FnOnce(&T) -> bool) -> bool {
        self.known().is_some_and(f)
    }

    fn from_option(value: Option<T>, missing: Missing) -> Self {
        match value {
            Some(v) => Signal::Known(v),
            None => Signal::Unknown(missing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stagnation {
    pub consecutive_polls: usize,
    pub dwell_secs: i64,
    pub stagnant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Disappearance {
    Present,
    Dropped {
        at: DateTime<Utc>,
    },
    Reappeared {
        dropped_at: DateTime<Utc>,
        back_at: DateTime<Utc>,
    },
}

/// Who is serving the trip right now, as opposed to who was first seen on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CurrentAssignment {
    Assigned(Assignment),
    /// The vehicle stopped reporting this trip, or predictions stopped
    /// naming a vehicle.
    Lost {
        vehicle_id: String,
        at: DateTime<Utc>,
    },
}

impl CurrentAssignment {
    pub fn assigned(&self) -> Option<&Assignment> {
        match self {
            CurrentAssignment::Assigned(a) => Some(a),
            CurrentAssignment::Lost { .. } => None,
        }
    }
}

/// How recently data was actually collected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Freshness {
    pub last_successful_poll_age_secs: i64,
    pub gaps_in_window: usize,
}

/// The full signal vocabulary for one trip at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripSignals {
    pub trip_id: TripId,
    pub evaluated_at: DateTime<Utc>,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub minutes_to_departure: Signal<f64>,
    pub minutes_to_scheduled_departure: Signal<f64>,
    pub assignment: Signal<Assignment>,
    pub current_assignment: Signal<CurrentAssignment>,
    pub assignment_delay_secs: Signal<i64>,
    pub eta_drift_secs: Signal<i64>,
    pub stagnation: Signal<Stagnation>,
    pub disappearance: Signal<Disappearance>,
    /// Whether the newest successful poll predicted this trip.
    pub in_latest_poll: Signal<bool>,
    pub prior_trip_lateness_secs: Signal<i64>,
    pub freshness: Signal<Freshness>,
    pub cancelled: bool,
}

impl TripSignals {
    pub fn currently_assigned(&self) -> bool {
        self.current_assignment.is_known_and(|c| c.assigned().is_some())
    }

    /// Minutes left before the T-minus escalation reference: the scheduled
    /// departure when known, the predicted one otherwise.
    pub fn minutes_for_escalation(&self) -> Option<f64> {
        self.minutes_to_scheduled_departure
            .known()
            .or(self.minutes_to_departure.known())
            .copied()
    }
}

/// Computes [`TripSignals`] from a [`TimelineStore`].
#[derive(Debug, Clone)]
pub struct SignalExtractor<'a> {
    route: &'a RouteConfig,
    thresholds: &'a Thresholds,
}

impl<'a> SignalExtractor<'a> {
    pub fn new(route: &'a RouteConfig, thresholds: &'a Thresholds) -> Self {
        Self { route, thresholds }
    }

    pub fn extract(&self, store: &TimelineStore, trip: &Trip, now: DateTime<Utc>) -> TripSignals {
        let assignment = Signal::from_option(trip.first_assignment(now).cloned(), Missing::Unassigned);
        let current_assignment = self.current_assignment(store, trip, now);

        let signals = TripSignals {
            trip_id: trip.trip_id.clone(),
            evaluated_at: now,
            scheduled_departure: trip.scheduled_departure,
            minutes_to_departure: self.minutes_to_departure(trip, now),
            minutes_to_scheduled_departure: match trip.scheduled_departure {
                Some(d) => Signal::Known(minutes_between(now, d)),
                None => Signal::Unknown(Missing::NoSchedule),
            },
            assignment_delay_secs: self.assignment_delay(trip, &assignment),
            eta_drift_secs: self.eta_drift(trip, now),
            stagnation: self.stagnation(trip, now),
            disappearance: disappearance(trip, now),
            in_latest_poll: match store.last_successful_poll(now) {
                Some(poll) => Signal::Known(trip.seen_in_poll(poll)),
                None => Signal::Unknown(Missing::NoSuccessfulPoll),
            },
            prior_trip_lateness_secs: self.prior_trip_lateness(store, trip, &current_assignment, now),
            freshness: self.freshness(store, now),
            cancelled: self.cancelled(trip, now),
            assignment,
            current_assignment,
        };
        trace!(trip_id = %signals.trip_id, ?signals, "Signals extracted");
        signals
    }

    fn minutes_to_departure(&self, trip: &Trip, now: DateTime<Utc>) -> Signal<f64> {
        let predicted = trip
            .predictions_at(&self.route.boarding_stop_id, now)
            .last()
            .and_then(|p| p.predicted_departure_time.or(p.predicted_arrival_time));
        Signal::from_option(
            predicted
                .or(trip.scheduled_departure)
                .map(|d| minutes_between(now, d)),
            Missing::NoDepartureReference,
        )
    }

    /// Follows the newest vehicle evidence forward: the assignment is lost once
    /// that vehicle reports something other than this trip, or once boarding
    /// predictions that used to name a vehicle stop doing so.
    fn current_assignment(
        &self,
        store: &TimelineStore,
        trip: &Trip,
        now: DateTime<Utc>,
    ) -> Signal<CurrentAssignment> {
        let Some(latest) = trip.latest_assignment(now) else {
            return Signal::Unknown(Missing::Unassigned);
        };

        let history: Vec<&VehiclePosition> =
            store.vehicle_history(&latest.vehicle_id, now).collect();
        let left_trip = history
            .iter()
            .rposition(|p| p.trip_id.as_deref() == Some(trip.trip_id.as_str()))
            .and_then(|i| history.get(i + 1))
            .map(|p| p.observed_at);

        let mut named = false;
        let mut unnamed_since = None;
        for p in trip.predictions_at(&self.route.boarding_stop_id, now) {
            if p.vehicle_id.is_some() {
                named = true;
                unnamed_since = None;
            } else if named && unnamed_since.is_none() {
                unnamed_since = Some(p.observed_at);
            }
        }

        match left_trip.into_iter().chain(unnamed_since).min() {
            Some(at) => Signal::Known(CurrentAssignment::Lost {
                vehicle_id: latest.vehicle_id,
                at,
            }),
            None => Signal::Known(CurrentAssignment::Assigned(latest)),
        }
    }

    fn assignment_delay(&self, trip: &Trip, assignment: &Signal<Assignment>) -> Signal<i64> {
        let Some(assigned) = assignment.known() else {
            return Signal::Unknown(Missing::Unassigned);
        };
        let Some(departs) = trip.scheduled_departure else {
            return Signal::Unknown(Missing::NoSchedule);
        };
        let window_opens = departs - self.thresholds.assignment_window();
        Signal::Known((assigned.at - window_opens).num_seconds())
    }

    /// Latest minus earliest predicted boarding time inside the trailing window.
    fn eta_drift(&self, trip: &Trip, now: DateTime<Utc>) -> Signal<i64> {
        let window = self.thresholds.drift_window();
        let samples: Vec<DateTime<Utc>> = trip
            .predictions_at(&self.route.boarding_stop_id, now)
            .filter(|p| within(p.observed_at, now, window))
            .filter_map(|p| p.best_time())
            .collect();

        match (samples.first(), samples.last()) {
            (Some(first), Some(last)) if samples.len() >= 2 => {
                Signal::Known((*last - *first).num_seconds())
            }
            _ if samples.is_empty() => Signal::Unknown(Missing::NoPredictions),
            _ => Signal::Unknown(Missing::TooFewPredictions),
        }
    }

    fn stagnation(&self, trip: &Trip, now: DateTime<Utc>) -> Signal<Stagnation> {
        let positions: Vec<_> = trip.positions(now).collect();
        let Some(latest) = positions.last() else {
            return Signal::Unknown(Missing::NoPositions);
        };
        let Some(marker) = latest.stop_marker() else {
            return Signal::Unknown(Missing::NoStopReported);
        };

        let run: Vec<_> = positions
            .iter()
            .rev()
            .filter(|p| p.vehicle_id == latest.vehicle_id)
            .take_while(|p| p.stop_marker().as_deref() == Some(marker.as_str()))
            .collect();
        let earliest = run.last().map_or(latest.observed_at, |p| p.observed_at);
        let dwell_secs = (latest.observed_at - earliest).num_seconds();
        let consecutive_polls = run.len();

        Signal::Known(Stagnation {
            consecutive_polls,
            dwell_secs,
            stagnant: consecutive_polls >= self.thresholds.stagnation_min_polls
                && dwell_secs >= self.thresholds.stagnation_dwell_secs,
        })
    }

    /// When the run our vehicle is finishing reaches the terminal, relative to
    /// our scheduled departure. Positive means it gets there after we were due
    /// to leave.
    ///
    /// The prior run is the last other trip the currently assigned vehicle
    /// reported. Its arrival is the first `STOPPED_AT` terminal position after
    /// its last position away from the terminal, else its latest predicted
    /// arrival there. Departure predictions are not arrivals and are ignored.
    fn prior_trip_lateness(
        &self,
        store: &TimelineStore,
        trip: &Trip,
        assignment: &Signal<CurrentAssignment>,
        now: DateTime<Utc>,
    ) -> Signal<i64> {
        let Some(departs) = trip.scheduled_departure else {
            return Signal::Unknown(Missing::NoSchedule);
        };
        let Some(vehicle) = assignment.known().and_then(CurrentAssignment::assigned) else {
            return Signal::Unknown(Missing::Unassigned);
        };

        let history: Vec<&VehiclePosition> =
            store.vehicle_history(&vehicle.vehicle_id, now).collect();
        let Some(prior_id) = history.iter().rev().find_map(|p| {
            p.trip_id
                .as_deref()
                .filter(|id| *id != trip.trip_id.as_str())
        }) else {
            return Signal::Unknown(Missing::NoPriorTrip);
        };

        let terminal = self.route.terminal_stop_id.as_str();
        let at_terminal = |p: &VehiclePosition| {
            p.status == VehicleStatus::Stopped && p.current_stop_id.as_deref() == Some(terminal)
        };
        let on_prior = |p: &VehiclePosition| p.trip_id.as_deref() == Some(prior_id);

        let from = match history
            .iter()
            .copied()
            .rposition(|p| on_prior(p) && !at_terminal(p))
        {
            Some(i) => i + 1,
            None => history.iter().copied().position(on_prior).unwrap_or(0),
        };
        let observed = history[from..]
            .iter()
            .copied()
            .find(|&p| at_terminal(p))
            .map(|p| p.observed_at);
        let predicted = || {
            store
                .trip(prior_id)?
                .predictions_at(terminal, now)
                .filter_map(|p| p.predicted_arrival_time)
                .last()
        };

        Signal::from_option(
            observed
                .or_else(predicted)
                .map(|arrival| (arrival - departs).num_seconds()),
            Missing::NoPriorArrival,
        )
    }

    fn freshness(&self, store: &TimelineStore, now: DateTime<Utc>) -> Signal<Freshness> {
        let Some(last_ok) = store.last_successful_poll(now) else {
            return Signal::Unknown(Missing::NoSuccessfulPoll);
        };
        let window = self.thresholds.gap_window();
        Signal::Known(Freshness {
            last_successful_poll_age_secs: (now - last_ok).num_seconds(),
            gaps_in_window: store
                .gaps()
                .filter(|g| within(g.poll_timestamp, now, window))
                .count(),
        })
    }

    fn cancelled(&self, trip: &Trip, now: DateTime<Utc>) -> bool {
        trip.predictions_at(&self.route.boarding_stop_id, now)
            .last()
            .is_some_and(|p| p.is_cancelled())
    }
}

fn disappearance(trip: &Trip, now: DateTime<Utc>) -> Signal<Disappearance> {
    if !trip.ever_predicted(now) {
        return Signal::Unknown(Missing::NoPredictions);
    }
    let state = match trip.markers(now).last() {
        Some(TimelineEntry::PredictionDropped { at, .. }) => Disappearance::Dropped { at: *at },
        Some(TimelineEntry::PredictionReappeared { at, dropped_at }) => {
            Disappearance::Reappeared {
                dropped_at: *dropped_at,
                back_at: *at,
            }
        }
        _ => Disappearance::Present,
    };
    Signal::Known(state)
}

/// Signed minutes from `now` to `then`, rounded to a tenth of a minute so
/// records are stable across platforms.
pub fn minutes_between(now: DateTime<Utc>, then: DateTime<Utc>) -> f64 {
    ((then - now).num_seconds() as f64 / 6.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimelineConfig;
    use crate::model::{PollEvent, PredictionSnapshot, VehiclePosition};
    use crate::schedule::Schedule;
    use chrono::{Duration, TimeZone};

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn prediction(trip: &str, stop: &str, at: i64, arrives: i64) -> PredictionSnapshot {
        PredictionSnapshot {
            trip_id: trip.to_string(),
            stop_id: stop.to_string(),
            direction: 1,
            stop_sequence: None,
            predicted_arrival_time: Some(ts(arrives)),
            predicted_departure_time: None,
            observed_at: ts(at),
            vehicle_id: None,
            schedule_relationship: None,
            polled_at: ts(at),
        }
    }

    fn position(trip: &str, stop: &str, at: i64) -> VehiclePosition {
        VehiclePosition {
            trip_id: Some(trip.to_string()),
            vehicle_id: Some("y1".to_string()),
            current_stop_id: Some(stop.to_string()),
            current_stop_sequence: None,
            status: VehicleStatus::Stopped,
            observed_at: ts(at),
            polled_at: ts(at),
        }
    }

    fn store_with(schedule: Schedule, events: Vec<PollEvent>) -> TimelineStore {
        let mut store = TimelineStore::new(schedule);
        store.ingest_all(&events, &TimelineConfig::default());
        store
    }

    fn poll(at: i64, p: Vec<PredictionSnapshot>, v: Vec<VehiclePosition>) -> PollEvent {
        PollEvent {
            poll_timestamp: ts(at),
            predictions: p,
            vehicles: v,
            error: None,
        }
    }

    fn extract(store: &TimelineStore, trip: &str, now: i64) -> TripSignals {
        let route = RouteConfig::default();
        let thresholds = Thresholds::default();
        SignalExtractor::new(&route, &thresholds).extract(store, store.trip(trip).unwrap(), ts(now))
    }

    #[test]
    fn test_unassigned_trip_yields_explicit_unknowns() {
        let store = store_with(
            Schedule::default(),
            vec![poll(0, vec![prediction("a", "5483", 0, 20)], vec![])],
        );
        let s = extract(&store, "a", 1);
        assert_eq!(s.assignment, Signal::Unknown(Missing::Unassigned));
        assert_eq!(s.current_assignment, Signal::Unknown(Missing::Unassigned));
        assert_eq!(s.in_latest_poll, Signal::Known(true));
        assert_eq!(s.assignment_delay_secs, Signal::Unknown(Missing::Unassigned));
        assert_eq!(s.stagnation, Signal::Unknown(Missing::NoPositions));
        assert_eq!(s.eta_drift_secs, Signal::Unknown(Missing::TooFewPredictions));
        assert_eq!(s.prior_trip_lateness_secs, Signal::Unknown(Missing::NoSchedule));
        assert_eq!(s.minutes_to_scheduled_departure, Signal::Unknown(Missing::NoSchedule));
        assert_eq!(s.minutes_to_departure, Signal::Known(19.0));
        assert_eq!(s.disappearance, Signal::Known(Disappearance::Present));
    }

    #[test]
    fn test_assignment_delay_from_window_opening() {
        let schedule = Schedule::from_pairs([("a", ts(30))]);
        let store = store_with(schedule, vec![poll(10, vec![], vec![position("a", "1", 10)])]);
        let s = extract(&store, "a", 11);
        // window opens at ts(0) with the default 30 minute window
        assert_eq!(s.assignment_delay_secs, Signal::Known(600));
    }

    #[test]
    fn test_eta_drift_ignores_observations_outside_window() {
        let events = vec![
            poll(0, vec![prediction("a", "5483", 0, 10)], vec![]),
            poll(20, vec![prediction("a", "5483", 20, 40)], vec![]),
            poll(21, vec![prediction("a", "5483", 21, 41)], vec![]),
        ];
        let store = store_with(Schedule::default(), events);
        let s = extract(&store, "a", 22);
        // the stale sample at ts(0) would make this 31 minutes
        assert_eq!(s.eta_drift_secs, Signal::Known(60));
    }

    #[test]
    fn test_stagnation_requires_polls_and_dwell() {
        let events: Vec<_> = (0..7)
            .map(|m| poll(m, vec![], vec![position("a", "42", m)]))
            .collect();
        let store = store_with(Schedule::default(), events);

        let early = extract(&store, "a", 2);
        assert_eq!(
            early.stagnation,
            Signal::Known(Stagnation {
                consecutive_polls: 3,
                dwell_secs: 120,
                stagnant: false
            })
        );
        let late = extract(&store, "a", 6);
        assert!(late.stagnation.is_known_and(|s| s.stagnant && s.dwell_secs == 360));
    }

    #[test]
    fn test_moving_vehicle_is_not_stagnant() {
        let events: Vec<_> = (0..7)
            .map(|m| poll(m, vec![], vec![position("a", &m.to_string(), m)]))
            .collect();
        let store = store_with(Schedule::default(), events);
        let s = extract(&store, "a", 6);
        assert!(s.stagnation.is_known_and(|s| !s.stagnant && s.consecutive_polls == 1));
    }

    #[test]
    fn test_disappearance_signal() {
        let events = vec![
            poll(0, vec![prediction("a", "5483", 0, 20)], vec![]),
            poll(5, vec![], vec![]),
        ];
        let store = store_with(Schedule::default(), events);
        assert_eq!(
            extract(&store, "a", 4).disappearance,
            Signal::Known(Disappearance::Present)
        );
        assert_eq!(
            extract(&store, "a", 6).disappearance,
            Signal::Known(Disappearance::Dropped { at: ts(5) })
        );
    }

    fn assigned(mut p: PredictionSnapshot, vehicle: &str) -> PredictionSnapshot {
        p.vehicle_id = Some(vehicle.to_string());
        p
    }

    fn unassigned_position(stop: &str, at: i64) -> VehiclePosition {
        VehiclePosition {
            trip_id: None,
            ..position("ignored", stop, at)
        }
    }

    #[test]
    fn test_presence_in_latest_poll() {
        let events = vec![
            poll(0, vec![prediction("a", "5483", 0, 2)], vec![]),
            poll(5, vec![prediction("b", "5483", 5, 20)], vec![]),
        ];
        let store = store_with(Schedule::default(), events);
        assert_eq!(extract(&store, "a", 4).in_latest_poll, Signal::Known(true));
        assert_eq!(extract(&store, "a", 6).in_latest_poll, Signal::Known(false));
    }

    #[test]
    fn test_assignment_lost_when_vehicle_drops_trip() {
        let mut events: Vec<_> = (0..3)
            .map(|m| poll(m, vec![prediction("a", "5483", m, 20)], vec![position("a", "1", m)]))
            .collect();
        events.push(poll(3, vec![prediction("a", "5483", 3, 20)], vec![unassigned_position("1", 3)]));
        let store = store_with(Schedule::default(), events);

        let before = extract(&store, "a", 2);
        assert!(before.currently_assigned());
        let after = extract(&store, "a", 3);
        assert!(!after.currently_assigned());
        assert_eq!(
            after.current_assignment,
            Signal::Known(CurrentAssignment::Lost {
                vehicle_id: "y1".to_string(),
                at: ts(3)
            })
        );
        // the first sighting is history, not a current fact
        assert!(after.assignment.is_known());
    }

    #[test]
    fn test_assignment_lost_when_predictions_drop_vehicle() {
        let events = vec![
            poll(0, vec![assigned(prediction("a", "5483", 0, 20), "y1")], vec![]),
            poll(1, vec![prediction("a", "5483", 1, 20)], vec![]),
            poll(2, vec![prediction("a", "5483", 2, 20)], vec![]),
        ];
        let store = store_with(Schedule::default(), events);
        assert_eq!(
            extract(&store, "a", 2).current_assignment,
            Signal::Known(CurrentAssignment::Lost {
                vehicle_id: "y1".to_string(),
                at: ts(1)
            })
        );
    }

    #[test]
    fn test_reassignment_to_another_vehicle_stays_assigned() {
        let mut moved = position("a", "2", 1);
        moved.vehicle_id = Some("y2".to_string());
        let events = vec![
            poll(0, vec![], vec![position("a", "1", 0)]),
            poll(1, vec![], vec![moved]),
        ];
        let store = store_with(Schedule::default(), events);
        let s = extract(&store, "a", 1);
        assert!(s.current_assignment.is_known_and(|c| {
            c.assigned().is_some_and(|a| a.vehicle_id == "y2")
        }));
    }

    #[test]
    fn test_prior_run_arrival_from_terminal_prediction() {
        let schedule = Schedule::from_pairs([("next", ts(30))]);
        let events = vec![poll(
            20,
            vec![
                prediction("prior", "7412", 20, 35),
                assigned(prediction("next", "5483", 20, 40), "y1"),
            ],
            vec![position("prior", "30", 20)],
        )];
        let store = store_with(schedule, events);
        let s = extract(&store, "next", 21);
        assert_eq!(s.prior_trip_lateness_secs, Signal::Known(300));
    }

    #[test]
    fn test_observed_terminal_arrival_beats_prediction() {
        let schedule = Schedule::from_pairs([("next", ts(30))]);
        let events = vec![
            poll(
                20,
                vec![prediction("prior", "7412", 20, 35)],
                vec![position("prior", "30", 20)],
            ),
            poll(25, vec![], vec![position("next", "7412", 25)]),
        ];
        let store = store_with(schedule, events);
        let s = extract(&store, "next", 26);
        assert_eq!(s.prior_trip_lateness_secs, Signal::Known(-300));
    }

    #[test]
    fn test_terminal_departure_is_not_an_arrival() {
        let schedule = Schedule::from_pairs([("next", ts(30))]);
        let mut departure = prediction("prior", "7412", 20, 35);
        departure.predicted_departure_time = departure.predicted_arrival_time.take();
        let events = vec![poll(
            20,
            vec![departure, assigned(prediction("next", "5483", 20, 40), "y1")],
            vec![position("prior", "30", 20)],
        )];
        let store = store_with(schedule, events);
        assert_eq!(
            extract(&store, "next", 21).prior_trip_lateness_secs,
            Signal::Unknown(Missing::NoPriorArrival)
        );
    }

    #[test]
    fn test_scheduled_predecessor_is_not_the_prior_run() {
        // p2 was never observed; p1's terminal prediction must not stand in for it
        let schedule = Schedule::from_pairs([("p1", ts(0)), ("p2", ts(15)), ("next", ts(30))]);
        let events = vec![poll(
            1,
            vec![
                prediction("p1", "7412", 1, 35),
                assigned(prediction("next", "5483", 1, 40), "y1"),
            ],
            vec![position("next", "7412", 1)],
        )];
        let store = store_with(schedule.clone(), events);
        assert_eq!(
            extract(&store, "next", 2).prior_trip_lateness_secs,
            Signal::Unknown(Missing::NoPriorTrip)
        );

        let unassigned = store_with(
            schedule,
            vec![poll(1, vec![prediction("p1", "7412", 1, 35), prediction("next", "5483", 1, 40)], vec![])],
        );
        assert_eq!(
            extract(&unassigned, "next", 2).prior_trip_lateness_secs,
            Signal::Unknown(Missing::Unassigned)
        );
    }

    #[test]
    fn test_freshness_counts_gaps() {
        let events = vec![
            poll(0, vec![prediction("a", "5483", 0, 20)], vec![]),
            PollEvent::failed(ts(1), "timeout"),
            PollEvent::failed(ts(2), "timeout"),
        ];
        let store = store_with(Schedule::default(), events);
        let s = extract(&store, "a", 3);
        assert_eq!(
            s.freshness,
            Signal::Known(Freshness {
                last_successful_poll_age_secs: 180,
                gaps_in_window: 2
            })
        );
    }

    #[test]
    fn test_cancelled_prediction() {
        let mut p = prediction("a", "5483", 0, 20);
        p.schedule_relationship = Some("CANCELLED".to_string());
        let store = store_with(Schedule::default(), vec![poll(0, vec![p], vec![])]);
        assert!(extract(&store, "a", 1).cancelled);
    }

    #[test]
    fn test_signals_ignore_future_observations() {
        let events = vec![
            poll(0, vec![prediction("a", "5483", 0, 20)], vec![]),
            poll(5, vec![], vec![position("a", "1", 5)]),
        ];
        let store = store_with(Schedule::default(), events);
        let s = extract(&store, "a", 3);
        assert_eq!(s.assignment, Signal::Unknown(Missing::Unassigned));
        assert_eq!(s.stagnation, Signal::Unknown(Missing::NoPositions));
    }

    #[test]
    fn test_minutes_between_rounds_to_tenths() {
        assert_eq!(minutes_between(ts(0), ts(0) + Duration::seconds(93)), 1.6);
        assert_eq!(minutes_between(ts(10), ts(0)), -10.0);
    }
}
