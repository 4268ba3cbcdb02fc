//! Ordered-rule confidence classification.
//!
//! A classifier is an explicit list of [`Rule`]s, each naming a predicate over
//! [`TripSignals`], the state it yields and the reason reported verbatim. The
//! first matching rule wins. Running off the end of the list is an error, not
//! a default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::Thresholds;
use crate::model::{ConfidenceState, TripId};
use crate::signals::{CurrentAssignment, Disappearance, Signal, TripSignals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    TripCancelled,
    NoVehicleByThreshold,
    LateAssignmentWithDrift,
    PredictionDisappeared,
    StaleData,
    AssignmentLost,
    Stagnation,
    PriorTripLate,
    PredictionFlickered,
    EtaUnstable,
    DataGaps,
    StableAssignment,
    InsufficientEvidence,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::TripCancelled => "trip_cancelled",
            RuleKind::NoVehicleByThreshold => "no_vehicle_by_threshold",
            RuleKind::LateAssignmentWithDrift => "late_assignment_with_drift",
            RuleKind::PredictionDisappeared => "prediction_disappeared",
            RuleKind::StaleData => "stale_data",
            RuleKind::AssignmentLost => "assignment_lost",
            RuleKind::Stagnation => "stagnation",
            RuleKind::PriorTripLate => "prior_trip_late",
            RuleKind::PredictionFlickered => "prediction_flickered",
            RuleKind::EtaUnstable => "eta_unstable",
            RuleKind::DataGaps => "data_gaps",
            RuleKind::StableAssignment => "stable_assignment",
            RuleKind::InsufficientEvidence => "insufficient_evidence",
        }
    }

    /// Whether this rule demands positive evidence and may therefore yield GOOD.
    pub fn is_corroborating(&self) -> bool {
        matches!(self, RuleKind::StableAssignment)
    }

    pub fn matches(&self, s: &TripSignals, t: &Thresholds) -> bool {
        match self {
            RuleKind::TripCancelled => s.cancelled,
            RuleKind::NoVehicleByThreshold => {
                !s.currently_assigned()
                    && s.minutes_for_escalation()
                        .is_some_and(|m| m <= t.no_vehicle_minutes)
            }
            RuleKind::LateAssignmentWithDrift => {
                s.assignment_delay_secs.is_known_and(|d| *d > t.late_assignment_secs)
                    && drift_exceeds(s, t.high_drift_secs)
            }
            RuleKind::PredictionDisappeared => s
                .disappearance
                .is_known_and(|d| matches!(d, Disappearance::Dropped { .. })),
            RuleKind::StaleData => match &s.freshness {
                Signal::Known(f) => f.last_successful_poll_age_secs > t.stale_data_secs,
                Signal::Unknown(_) => true,
            },
            RuleKind::AssignmentLost => s
                .current_assignment
                .is_known_and(|c| matches!(c, CurrentAssignment::Lost { .. })),
            RuleKind::Stagnation => s.stagnation.is_known_and(|st| st.stagnant),
            RuleKind::PriorTripLate => prior_trip_late(s, t),
            RuleKind::PredictionFlickered => s
                .disappearance
                .is_known_and(|d| matches!(d, Disappearance::Reappeared { .. })),
            RuleKind::EtaUnstable => drift_exceeds(s, t.high_drift_secs),
            RuleKind::DataGaps => s
                .freshness
                .is_known_and(|f| f.gaps_in_window > t.max_gaps_in_window),
            RuleKind::StableAssignment => corroborated_good(s, t),
            RuleKind::InsufficientEvidence => true,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn drift_exceeds(s: &TripSignals, limit: i64) -> bool {
    s.eta_drift_secs.is_known_and(|d| d.abs() > limit)
}

fn prior_trip_late(s: &TripSignals, t: &Thresholds) -> bool {
    s.prior_trip_lateness_secs
        .is_known_and(|l| *l > t.prior_trip_late_secs)
}

/// GOOD needs every one of these to be positively observed, so absence of
/// data can never read as good news.
fn corroborated_good(s: &TripSignals, t: &Thresholds) -> bool {
    let assigned = s.currently_assigned();
    let stable = s.eta_drift_secs.is_known_and(|d| d.abs() <= t.stable_drift_secs);
    let present = s
        .disappearance
        .is_known_and(|d| matches!(d, Disappearance::Present))
        && s.in_latest_poll.is_known_and(|seen| *seen);
    let moving = s.stagnation.is_known_and(|st| !st.stagnant);
    let fresh = s.freshness.is_known_and(|f| {
        f.last_successful_poll_age_secs <= t.stale_data_secs
            && f.gaps_in_window <= t.max_gaps_in_window
    });

    assigned && stable && present && moving && fresh && !s.cancelled && !prior_trip_late(s, t)
}

/// One entry of the decision list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub rule: RuleKind,
    pub state: ConfidenceState,
    pub reason: String,
}

impl Rule {
    pub fn new(rule: RuleKind, state: ConfidenceState, reason: &str) -> Self {
        Self {
            rule,
            state,
            reason: reason.to_string(),
        }
    }
}

/// The stock decision list, most severe evidence first.
pub fn default_rules() -> Vec<Rule> {
    use ConfidenceState::{Bad, Good, Risky};
    vec![
        Rule::new(RuleKind::TripCancelled, Bad, "trip cancelled"),
        Rule::new(RuleKind::NoVehicleByThreshold, Bad, "no vehicle assigned"),
        Rule::new(RuleKind::LateAssignmentWithDrift, Risky, "late assignment + ETA drift"),
        Rule::new(RuleKind::PredictionDisappeared, Bad, "prediction disappeared"),
        Rule::new(RuleKind::StaleData, Bad, "no recent data collected"),
        Rule::new(RuleKind::AssignmentLost, Risky, "vehicle assignment lost"),
        Rule::new(RuleKind::Stagnation, Risky, "vehicle stagnant"),
        Rule::new(RuleKind::PriorTripLate, Risky, "prior trip running late"),
        Rule::new(RuleKind::PredictionFlickered, Risky, "prediction flickered"),
        Rule::new(RuleKind::EtaUnstable, Risky, "ETA drifting"),
        Rule::new(RuleKind::DataGaps, Risky, "recent polling gaps"),
        Rule::new(RuleKind::StableAssignment, Good, "vehicle assigned, ETA stable"),
        Rule::new(RuleKind::InsufficientEvidence, Risky, "insufficient data"),
    ]
}

#[derive(Debug, Error, PartialEq)]
pub enum ClassificationError {
    #[error("no classification rule matched trip {trip_id} at {evaluated_at}; rule list is incomplete")]
    RuleExhaustion {
        trip_id: TripId,
        evaluated_at: DateTime<Utc>,
    },
}

/// The verdict plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub state: ConfidenceState,
    pub reason: String,
    pub rule: RuleKind,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
    thresholds: Thresholds,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>, thresholds: Thresholds) -> Self {
        Self { rules, thresholds }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Applies the rules in order and returns the first match.
    ///
    /// # Errors
    ///
    /// Returns [`ClassificationError::RuleExhaustion`] when no rule matches.
    pub fn classify(&self, signals: &TripSignals) -> Result<Classification, ClassificationError> {
        for rule in &self.rules {
            if rule.rule.matches(signals, &self.thresholds) {
                debug!(
                    trip_id = %signals.trip_id,
                    rule = %rule.rule,
                    state = %rule.state,
                    "Rule fired"
                );
                return Ok(Classification {
                    state: rule.state,
                    reason: rule.reason.clone(),
                    rule: rule.rule,
                });
            }
        }

        error!(
            trip_id = %signals.trip_id,
            evaluated_at = %signals.evaluated_at,
            rules = self.rules.len(),
            "Classification rules exhausted"
        );
        Err(ClassificationError::RuleExhaustion {
            trip_id: signals.trip_id.clone(),
            evaluated_at: signals.evaluated_at,
        })
    }
}

/// Signals with nothing observed at all; used as the baseline in tests.
#[cfg(test)]
pub(crate) fn blank_signals(trip_id: &str, now: DateTime<Utc>) -> TripSignals {
    use crate::signals::Missing;
    TripSignals {
        trip_id: trip_id.to_string(),
        evaluated_at: now,
        scheduled_departure: None,
        minutes_to_departure: Signal::Unknown(Missing::NoDepartureReference),
        minutes_to_scheduled_departure: Signal::Unknown(Missing::NoSchedule),
        assignment: Signal::Unknown(Missing::Unassigned),
        current_assignment: Signal::Unknown(Missing::Unassigned),
        assignment_delay_secs: Signal::Unknown(Missing::Unassigned),
        eta_drift_secs: Signal::Unknown(Missing::NoPredictions),
        stagnation: Signal::Unknown(Missing::NoPositions),
        disappearance: Signal::Unknown(Missing::NoPredictions),
        in_latest_poll: Signal::Unknown(Missing::NoSuccessfulPoll),
        prior_trip_lateness_secs: Signal::Unknown(Missing::NoSchedule),
        freshness: Signal::Unknown(Missing::NoSuccessfulPoll),
        cancelled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{Freshness, Missing, Stagnation};
    use crate::timeline::Assignment;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()
    }

    fn classifier() -> Classifier {
        Classifier::new(default_rules(), Thresholds::default())
    }

    /// A trip with every piece of positive evidence present.
    fn healthy() -> TripSignals {
        let assignment = Assignment {
            vehicle_id: "y1".to_string(),
            at: now(),
        };
        TripSignals {
            minutes_to_departure: Signal::Known(20.0),
            minutes_to_scheduled_departure: Signal::Known(20.0),
            current_assignment: Signal::Known(CurrentAssignment::Assigned(assignment.clone())),
            assignment: Signal::Known(assignment),
            assignment_delay_secs: Signal::Known(600),
            eta_drift_secs: Signal::Known(30),
            stagnation: Signal::Known(Stagnation {
                consecutive_polls: 1,
                dwell_secs: 0,
                stagnant: false,
            }),
            disappearance: Signal::Known(Disappearance::Present),
            in_latest_poll: Signal::Known(true),
            freshness: Signal::Known(Freshness {
                last_successful_poll_age_secs: 10,
                gaps_in_window: 0,
            }),
            ..blank_signals("t1", now())
        }
    }

    #[test]
    fn test_healthy_trip_is_good() {
        let c = classifier().classify(&healthy()).unwrap();
        assert_eq!(c.state, ConfidenceState::Good);
        assert_eq!(c.rule, RuleKind::StableAssignment);
    }

    #[test]
    fn test_blank_signals_are_not_good() {
        let c = classifier().classify(&blank_signals("t1", now())).unwrap();
        assert_ne!(c.state, ConfidenceState::Good);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut s = healthy();
        s.cancelled = true;
        s.disappearance = Signal::Known(Disappearance::Dropped { at: now() });
        let c = classifier().classify(&s).unwrap();
        assert_eq!(c.rule, RuleKind::TripCancelled);
        assert_eq!(c.reason, "trip cancelled");
    }

    #[test]
    fn test_each_negative_signal_blocks_good() {
        let mutations: Vec<Box<dyn Fn(&mut TripSignals)>> = vec![
            Box::new(|s| s.current_assignment = Signal::Unknown(Missing::Unassigned)),
            Box::new(|s| {
                s.current_assignment = Signal::Known(CurrentAssignment::Lost {
                    vehicle_id: "y1".to_string(),
                    at: now(),
                })
            }),
            Box::new(|s| s.in_latest_poll = Signal::Known(false)),
            Box::new(|s| s.in_latest_poll = Signal::Unknown(Missing::NoSuccessfulPoll)),
            Box::new(|s| s.eta_drift_secs = Signal::Known(400)),
            Box::new(|s| s.eta_drift_secs = Signal::Unknown(Missing::TooFewPredictions)),
            Box::new(|s| s.disappearance = Signal::Known(Disappearance::Dropped { at: now() })),
            Box::new(|s| {
                s.disappearance = Signal::Known(Disappearance::Reappeared {
                    dropped_at: now(),
                    back_at: now(),
                })
            }),
            Box::new(|s| {
                s.stagnation = Signal::Known(Stagnation {
                    consecutive_polls: 10,
                    dwell_secs: 900,
                    stagnant: true,
                })
            }),
            Box::new(|s| s.stagnation = Signal::Unknown(Missing::NoPositions)),
            Box::new(|s| s.freshness = Signal::Unknown(Missing::NoSuccessfulPoll)),
            Box::new(|s| s.prior_trip_lateness_secs = Signal::Known(900)),
            Box::new(|s| s.cancelled = true),
        ];
        for (i, mutate) in mutations.iter().enumerate() {
            let mut s = healthy();
            mutate(&mut s);
            let c = classifier().classify(&s).unwrap();
            assert_ne!(c.state, ConfidenceState::Good, "mutation {i} still GOOD");
        }
    }

    #[test]
    fn test_stable_rule_first_still_not_good_when_stagnant() {
        let rules = vec![
            Rule::new(RuleKind::StableAssignment, ConfidenceState::Good, "ok"),
            Rule::new(RuleKind::InsufficientEvidence, ConfidenceState::Risky, "insufficient data"),
        ];
        let mut s = healthy();
        s.stagnation = Signal::Known(Stagnation {
            consecutive_polls: 10,
            dwell_secs: 900,
            stagnant: true,
        });
        let c = Classifier::new(rules, Thresholds::default()).classify(&s).unwrap();
        assert_eq!(c.state, ConfidenceState::Risky);
    }

    #[test]
    fn test_no_vehicle_threshold() {
        let mut s = blank_signals("t1", now());
        s.minutes_to_scheduled_departure = Signal::Known(13.0);
        assert_ne!(
            classifier().classify(&s).unwrap().rule,
            RuleKind::NoVehicleByThreshold
        );
        s.minutes_to_scheduled_departure = Signal::Known(12.0);
        let c = classifier().classify(&s).unwrap();
        assert_eq!(c.state, ConfidenceState::Bad);
        assert_eq!(c.reason, "no vehicle assigned");
    }

    #[test]
    fn test_late_assignment_with_drift() {
        let mut s = healthy();
        s.assignment_delay_secs = Signal::Known(1200);
        s.eta_drift_secs = Signal::Known(360);
        let c = classifier().classify(&s).unwrap();
        assert_eq!(c.state, ConfidenceState::Risky);
        assert_eq!(c.reason, "late assignment + ETA drift");
    }

    #[test]
    fn test_lost_assignment_is_risky_then_bad_at_threshold() {
        let mut s = healthy();
        s.current_assignment = Signal::Known(CurrentAssignment::Lost {
            vehicle_id: "y1".to_string(),
            at: now(),
        });
        let c = classifier().classify(&s).unwrap();
        assert_eq!(c.rule, RuleKind::AssignmentLost);
        assert_eq!(c.state, ConfidenceState::Risky);
        assert_eq!(c.reason, "vehicle assignment lost");

        s.minutes_to_scheduled_departure = Signal::Known(10.0);
        let c = classifier().classify(&s).unwrap();
        assert_eq!(c.state, ConfidenceState::Bad);
        assert_eq!(c.reason, "no vehicle assigned");
    }

    #[test]
    fn test_rule_exhaustion_is_an_error() {
        let rules = vec![Rule::new(
            RuleKind::TripCancelled,
            ConfidenceState::Bad,
            "trip cancelled",
        )];
        let err = Classifier::new(rules, Thresholds::default())
            .classify(&healthy())
            .unwrap_err();
        assert_eq!(
            err,
            ClassificationError::RuleExhaustion {
                trip_id: "t1".to_string(),
                evaluated_at: now()
            }
        );
    }

    #[test]
    fn test_rule_kind_round_trips_through_name() {
        for rule in default_rules() {
            let json = serde_json::to_string(&rule.rule).unwrap();
            assert_eq!(json, format!("\"{}\"", rule.rule.as_str()));
        }
    }
}
