use super::transitions::Transition;
use crate::db::models::MatchSnapshot;
use crate::notify::Notification;

// Limits imposed by Farcaster clients on frame notifications.
pub const MAX_TITLE_CHARS: usize = 32;
pub const MAX_BODY_CHARS: usize = 128;
pub const MAX_NOTIFICATION_ID_CHARS: usize = 128;

/// Render one transition of `snapshot` as a deliverable notification.
pub fn format_notification(
    snapshot: &MatchSnapshot,
    transition: &Transition,
    target_url: &str,
) -> Notification {
    let home = &snapshot.home;
    let away = &snapshot.away;
    let scoreline = format!(
        "{} {}-{} {}",
        home.name, snapshot.home_score, snapshot.away_score, away.name
    );
    let short_scoreline = format!(
        "{} {}-{} {}",
        home.abbreviation, snapshot.home_score, snapshot.away_score, away.abbreviation
    );

    let (title, body, discriminator) = match transition {
        Transition::Kickoff => (
            "⚽ Kickoff!".to_string(),
            format!("{} vs {} is under way ({})", home.name, away.name, snapshot.league),
            String::new(),
        ),
        Transition::Goal { scorer, clock } => (
            format!("⚽ GOAL! {}", short_scoreline),
            format!("{} {} | {}", scorer, clock, scoreline),
            String::new(),
        ),
        Transition::YellowCard { incident_key, player, clock, team } => (
            "🟨 Yellow card".to_string(),
            card_body(player, team.as_deref(), clock, &scoreline),
            incident_key.clone(),
        ),
        Transition::RedCard { incident_key, player, clock, team } => (
            "🟥 Red card!".to_string(),
            card_body(player, team.as_deref(), clock, &scoreline),
            incident_key.clone(),
        ),
        Transition::Halftime => (
            "⏸ Half-time".to_string(),
            format!("HT: {}", scoreline),
            String::new(),
        ),
        Transition::FullTime => (
            "🏁 Full-time".to_string(),
            format!("FT: {}", scoreline),
            String::new(),
        ),
    };

    let mut notification_id = format!(
        "{}-{}-{}-{}",
        snapshot.match_id,
        transition.kind(),
        snapshot.home_score,
        snapshot.away_score
    );
    if !discriminator.is_empty() {
        notification_id.push('-');
        notification_id.push_str(&discriminator);
    }

    Notification {
        notification_id: truncate_chars(&notification_id, MAX_NOTIFICATION_ID_CHARS),
        title: truncate_chars(&title, MAX_TITLE_CHARS),
        body: truncate_chars(&body, MAX_BODY_CHARS),
        target_url: target_url.to_string(),
    }
}

fn card_body(player: &str, team: Option<&str>, clock: &str, scoreline: &str) -> String {
    match team {
        Some(team) => format!("{} ({}) {} | {}", player, team, clock, scoreline),
        None => format!("{} {} | {}", player, clock, scoreline),
    }
}

/// Cut `s` to at most `max` chars, marking the cut with an ellipsis.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{MatchPhase, TeamRef};

    fn snapshot() -> MatchSnapshot {
        MatchSnapshot {
            match_id: "701234".into(),
            league: "English Premier League".into(),
            home: TeamRef { id: "359".into(), name: "Arsenal".into(), abbreviation: "ARS".into() },
            away: TeamRef { id: "363".into(), name: "Chelsea".into(), abbreviation: "CHE".into() },
            home_score: 2,
            away_score: 0,
            status: MatchPhase::InProgress,
            incidents: vec![],
        }
    }

    #[test]
    fn test_goal_message() {
        let n = format_notification(
            &snapshot(),
            &Transition::Goal { scorer: "Bukayo Saka".into(), clock: "67'".into() },
            "https://frame.example",
        );
        assert_eq!(n.title, "⚽ GOAL! ARS 2-0 CHE");
        assert_eq!(n.body, "Bukayo Saka 67' | Arsenal 2-0 Chelsea");
        assert_eq!(n.notification_id, "701234-goal-2-0");
        assert_eq!(n.target_url, "https://frame.example");
    }

    #[test]
    fn test_card_ids_are_distinct_per_incident() {
        let card = |key: &str| Transition::YellowCard {
            incident_key: key.into(),
            player: "Declan Rice".into(),
            clock: "30'".into(),
            team: Some("Arsenal".into()),
        };
        let a = format_notification(&snapshot(), &card("14:1800:359:Declan Rice"), "u");
        let b = format_notification(&snapshot(), &card("14:2400:359:Declan Rice"), "u");
        assert_ne!(a.notification_id, b.notification_id);
        assert_eq!(a.body, "Declan Rice (Arsenal) 30' | Arsenal 2-0 Chelsea");
    }

    #[test]
    fn test_limits_are_respected() {
        let mut s = snapshot();
        s.home.abbreviation = "WOLVERHAMPTON WANDERERS".into();
        s.home.name = "x".repeat(200);
        let n = format_notification(
            &s,
            &Transition::Goal { scorer: "Pedro".into(), clock: "90'+4'".into() },
            "u",
        );
        assert_eq!(n.title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(n.body.chars().count(), MAX_BODY_CHARS);
        assert!(n.title.ends_with('…'));
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("⚽⚽⚽", 2), "⚽…");
        assert_eq!(truncate_chars("short", 32), "short");
    }
}
