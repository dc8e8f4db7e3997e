use serde::Serialize;
use std::collections::HashSet;
use tracing::warn;

use crate::db::models::{Incident, IncidentKind, MatchPhase, MatchSnapshot, MatchState};

pub const UNKNOWN_PLAYER: &str = "unknown player";
pub const UNKNOWN_CLOCK: &str = "00:00";

/// A notifiable change between two observations of the same match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Kickoff,
    Goal { scorer: String, clock: String },
    YellowCard { incident_key: String, player: String, clock: String, team: Option<String> },
    RedCard { incident_key: String, player: String, clock: String, team: Option<String> },
    Halftime,
    FullTime,
}

impl Transition {
    pub fn kind(&self) -> &'static str {
        match self {
            Transition::Kickoff => "kickoff",
            Transition::Goal { .. } => "goal",
            Transition::YellowCard { .. } => "yellow_card",
            Transition::RedCard { .. } => "red_card",
            Transition::Halftime => "halftime",
            Transition::FullTime => "full_time",
        }
    }
}

/// Transitions for a match seen for the first time: only a kickoff, and only
/// when it is already under way.
pub fn first_observation(current: &MatchSnapshot) -> Vec<Transition> {
    if current.status == MatchPhase::InProgress {
        vec![Transition::Kickoff]
    } else {
        vec![]
    }
}

/// Every transition between the stored state and the current observation,
/// in kickoff, goal, cards, halftime, full-time order.
pub fn detect_transitions(previous: &MatchState, current: &MatchSnapshot) -> Vec<Transition> {
    let mut out = Vec::new();

    if previous.status == MatchPhase::Scheduled && current.status == MatchPhase::InProgress {
        out.push(Transition::Kickoff);
    }

    if current.home_score != previous.home_score || current.away_score != previous.away_score {
        let (scorer, clock) = latest_goal(&current.incidents);
        out.push(Transition::Goal { scorer, clock });
    }

    if current.details_hash() != previous.details_hash {
        for incident in new_incidents(previous, current) {
            let player = incident.player.clone().unwrap_or_else(|| UNKNOWN_PLAYER.to_string());
            let clock = incident
                .clock_display
                .clone()
                .unwrap_or_else(|| UNKNOWN_CLOCK.to_string());
            let team = current.team_name(incident.team_id.as_deref()).map(str::to_string);
            let incident_key = incident.key.clone();
            match incident.kind {
                IncidentKind::YellowCard => out.push(Transition::YellowCard { incident_key, player, clock, team }),
                IncidentKind::RedCard => out.push(Transition::RedCard { incident_key, player, clock, team }),
                IncidentKind::Goal | IncidentKind::Other => {}
            }
        }
    }

    if previous.status != MatchPhase::Halftime && current.status == MatchPhase::Halftime {
        out.push(Transition::Halftime);
    }

    if previous.status != MatchPhase::FullTime && current.status == MatchPhase::FullTime {
        out.push(Transition::FullTime);
    }

    out
}

/// Scorer and clock of the latest goal incident by match clock.
pub fn latest_goal(incidents: &[Incident]) -> (String, String) {
    let mut sorted: Vec<&Incident> = incidents.iter().collect();
    sorted.sort_by(|a, b| {
        a.clock_seconds
            .partial_cmp(&b.clock_seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    match sorted.iter().rev().find(|i| i.kind == IncidentKind::Goal) {
        Some(goal) => (
            goal.player.clone().unwrap_or_else(|| UNKNOWN_PLAYER.to_string()),
            goal.clock_display.clone().unwrap_or_else(|| UNKNOWN_CLOCK.to_string()),
        ),
        None => (UNKNOWN_PLAYER.to_string(), UNKNOWN_CLOCK.to_string()),
    }
}

/// Incidents in `current` whose key was not in the previous snapshot.
fn new_incidents<'a>(previous: &MatchState, current: &'a MatchSnapshot) -> Vec<&'a Incident> {
    let Some(known) = previous.incident_keys() else {
        warn!(
            "Unreadable incident snapshot for match {}; not announcing cards this poll",
            previous.match_id
        );
        return vec![];
    };
    let known: HashSet<String> = known.into_iter().collect();
    current
        .incidents
        .iter()
        .filter(|i| !known.contains(&i.key))
        .collect()
}
