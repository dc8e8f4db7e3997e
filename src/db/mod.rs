use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

pub mod models;
pub mod store;
pub mod upstash;

use models::*;
pub use store::StateStore;
pub use upstash::UpstashStore;

/// Thread-safe SQLite store (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // In-memory databases answer "memory" here; that is fine.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        // Match states used to be keyed by match id alone; each audience now
        // gets its own copy of the old row.
        let legacy = has_column(&conn, "match_states", "match_id")?
            && !has_column(&conn, "match_states", "audience")?;
        if legacy {
            conn.execute("ALTER TABLE match_states RENAME TO match_states_legacy", [])?;
        }
        conn.execute_batch(SCHEMA_SQL)?;
        if legacy {
            conn.execute_batch(COPY_LEGACY_MATCH_STATES_SQL)?;
            info!("Migrated match states to per-audience records");
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    // ── Match state ──────────────────────────────────────────────────────────

    pub fn get_match_state(&self, match_id: &str, audience: Audience) -> Result<Option<MatchState>> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT match_id, audience, home_score, away_score, status, details_hash, version, updated_at
                 FROM match_states WHERE match_id = ?1 AND audience = ?2",
                params![match_id, audience.as_str()],
                map_match_state,
            )
            .optional()?;
        Ok(state)
    }

    /// Insert or version-checked update of a match state.
    pub fn put_match_state(&self, state: &MatchState, expected_version: Option<u64>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = match expected_version {
            None => conn.execute(
                "INSERT INTO match_states (
                    match_id, audience, home_score, away_score, status, details_hash, version, updated_at
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                 ON CONFLICT(match_id, audience) DO NOTHING",
                params![
                    state.match_id,
                    state.audience.as_str(),
                    state.home_score,
                    state.away_score,
                    state.status.as_str(),
                    state.details_hash,
                    state.version as i64,
                    state.updated_at,
                ],
            )?,
            Some(expected) => conn.execute(
                "UPDATE match_states
                 SET home_score=?3, away_score=?4, status=?5, details_hash=?6,
                     version=?7, updated_at=?8
                 WHERE match_id=?1 AND audience=?2 AND version=?9",
                params![
                    state.match_id,
                    state.audience.as_str(),
                    state.home_score,
                    state.away_score,
                    state.status.as_str(),
                    state.details_hash,
                    state.version as i64,
                    state.updated_at,
                    expected as i64,
                ],
            )?,
        };
        Ok(changed == 1)
    }

    pub fn all_match_states(&self) -> Result<Vec<MatchState>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT match_id, audience, home_score, away_score, status, details_hash, version, updated_at
             FROM match_states ORDER BY updated_at DESC, audience",
        )?;
        let states = stmt
            .query_map([], map_match_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    // ── Notification details ─────────────────────────────────────────────────

    pub fn get_details(&self, fid: u64) -> Result<Option<NotificationDetails>> {
        let conn = self.lock()?;
        let details = conn
            .query_row(
                "SELECT url, token FROM notification_details WHERE fid = ?1",
                params![fid as i64],
                |row| {
                    Ok(NotificationDetails {
                        url: row.get(0)?,
                        token: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(details)
    }

    pub fn upsert_details(&self, fid: u64, details: &NotificationDetails) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO notification_details (fid, url, token, updated_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(fid) DO UPDATE SET
                url=excluded.url,
                token=excluded.token,
                updated_at=excluded.updated_at",
            params![fid as i64, details.url, details.token, Utc::now()],
        )?;
        Ok(())
    }

    pub fn remove_details(&self, fid: u64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM notification_details WHERE fid = ?1",
            params![fid as i64],
        )?;
        Ok(())
    }

    pub fn all_subscribers(&self) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT fid, url, token FROM notification_details ORDER BY fid")?;
        let recipients = stmt
            .query_map([], map_recipient)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(recipients)
    }

    // ── Team preferences ─────────────────────────────────────────────────────

    pub fn get_teams(&self, fid: u64) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT team_id FROM team_preferences WHERE fid = ?1 ORDER BY team_id")?;
        let teams = stmt
            .query_map(params![fid as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(teams)
    }

    pub fn replace_teams(&self, fid: u64, teams: &[String]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM team_preferences WHERE fid = ?1",
            params![fid as i64],
        )?;
        for team in teams {
            tx.execute(
                "INSERT OR IGNORE INTO team_preferences (fid, team_id) VALUES (?1, ?2)",
                params![fid as i64, team],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn team_subscribers(&self, team_ids: &[&str]) -> Result<Vec<Recipient>> {
        if team_ids.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = (1..=team_ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT n.fid, n.url, n.token FROM notification_details n
             WHERE n.fid IN (SELECT fid FROM team_preferences WHERE team_id IN ({}))
             ORDER BY n.fid",
            placeholders
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let recipients = stmt
            .query_map(params_from_iter(team_ids.iter()), map_recipient)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(recipients)
    }
}

#[async_trait]
impl StateStore for Database {
    async fn load_match_state(
        &self,
        match_id: &str,
        audience: Audience,
    ) -> Result<Option<MatchState>> {
        self.get_match_state(match_id, audience)
    }

    async fn save_match_state(
        &self,
        state: &MatchState,
        expected_version: Option<u64>,
    ) -> Result<bool> {
        self.put_match_state(state, expected_version)
    }

    async fn list_match_states(&self) -> Result<Vec<MatchState>> {
        self.all_match_states()
    }

    async fn get_notification_details(&self, fid: u64) -> Result<Option<NotificationDetails>> {
        self.get_details(fid)
    }

    async fn set_notification_details(
        &self,
        fid: u64,
        details: &NotificationDetails,
    ) -> Result<()> {
        self.upsert_details(fid, details)
    }

    async fn delete_notification_details(&self, fid: u64) -> Result<()> {
        self.remove_details(fid)
    }

    async fn list_subscribers(&self) -> Result<Vec<Recipient>> {
        self.all_subscribers()
    }

    async fn get_team_preferences(&self, fid: u64) -> Result<Vec<String>> {
        self.get_teams(fid)
    }

    async fn set_team_preferences(&self, fid: u64, teams: &[String]) -> Result<()> {
        self.replace_teams(fid, teams)
    }

    async fn delete_team_preferences(&self, fid: u64) -> Result<()> {
        self.replace_teams(fid, &[])
    }

    async fn list_team_subscribers(&self, team_ids: &[&str]) -> Result<Vec<Recipient>> {
        self.team_subscribers(team_ids)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_match_state(row: &rusqlite::Row) -> rusqlite::Result<MatchState> {
    let audience: String = row.get(1)?;
    let audience = Audience::parse(&audience)
        .ok_or_else(|| bad_text(1, format!("unknown audience '{}'", audience)))?;
    let status: String = row.get(4)?;
    let status = MatchPhase::parse(&status)
        .ok_or_else(|| bad_text(4, format!("unknown match status '{}'", status)))?;
    let version: i64 = row.get(6)?;
    Ok(MatchState {
        match_id: row.get(0)?,
        audience,
        home_score: row.get(2)?,
        away_score: row.get(3)?,
        status,
        details_hash: row.get(5)?,
        version: version as u64,
        updated_at: row.get(7)?,
    })
}

fn bad_text(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn map_recipient(row: &rusqlite::Row) -> rusqlite::Result<Recipient> {
    let fid: i64 = row.get(0)?;
    Ok(Recipient {
        fid: fid as u64,
        details: NotificationDetails {
            url: row.get(1)?,
            token: row.get(2)?,
        },
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS match_states (
    match_id     TEXT    NOT NULL,
    audience     TEXT    NOT NULL,
    home_score   INTEGER NOT NULL,
    away_score   INTEGER NOT NULL,
    status       TEXT    NOT NULL,
    details_hash TEXT    NOT NULL DEFAULT '[]',
    version      INTEGER NOT NULL,
    updated_at   TEXT    NOT NULL,
    PRIMARY KEY (match_id, audience)
);

CREATE TABLE IF NOT EXISTS notification_details (
    fid        INTEGER PRIMARY KEY,
    url        TEXT    NOT NULL,
    token      TEXT    NOT NULL,
    updated_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS team_preferences (
    fid     INTEGER NOT NULL,
    team_id TEXT    NOT NULL,
    PRIMARY KEY (fid, team_id)
);

CREATE INDEX IF NOT EXISTS idx_team_preferences_team ON team_preferences(team_id);
"#;

const COPY_LEGACY_MATCH_STATES_SQL: &str = r#"
INSERT OR IGNORE INTO match_states
    (match_id, audience, home_score, away_score, status, details_hash, version, updated_at)
SELECT match_id, a.audience, home_score, away_score, status, details_hash, version, updated_at
FROM match_states_legacy, (SELECT 'all' AS audience UNION ALL SELECT 'team') AS a;

DROP TABLE match_states_legacy;
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn state(home: u32, away: u32, version: u64) -> MatchState {
        MatchState {
            match_id: "701234".into(),
            audience: Audience::All,
            home_score: home,
            away_score: away,
            status: MatchPhase::InProgress,
            details_hash: "[]".into(),
            version,
            updated_at: Utc::now(),
        }
    }

    fn details(token: &str) -> NotificationDetails {
        NotificationDetails {
            url: "https://api.warpcast.com/v1/frame-notifications".into(),
            token: token.into(),
        }
    }

    #[test]
    fn test_match_state_insert_then_versioned_update() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.get_match_state("701234", Audience::All).unwrap().is_none());

        assert!(db.put_match_state(&state(0, 0, 1), None).unwrap());
        // Second insert of the same match loses
        assert!(!db.put_match_state(&state(0, 0, 1), None).unwrap());

        assert!(db.put_match_state(&state(1, 0, 2), Some(1)).unwrap());
        // Stale writer still expecting version 1
        assert!(!db.put_match_state(&state(2, 0, 2), Some(1)).unwrap());

        let stored = db.get_match_state("701234", Audience::All).unwrap().unwrap();
        assert_eq!(stored.home_score, 1);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.status, MatchPhase::InProgress);
    }

    #[test]
    fn test_match_state_is_kept_per_audience() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.put_match_state(&state(1, 0, 1), None).unwrap());

        let mut team = state(0, 0, 1);
        team.audience = Audience::Team;
        // The team record is independent of the one already stored for all fans
        assert!(db.put_match_state(&team, None).unwrap());
        team.home_score = 2;
        team.version = 2;
        assert!(db.put_match_state(&team, Some(1)).unwrap());

        let all = db.get_match_state("701234", Audience::All).unwrap().unwrap();
        let team = db.get_match_state("701234", Audience::Team).unwrap().unwrap();
        assert_eq!((all.home_score, all.version), (1, 1));
        assert_eq!((team.home_score, team.version), (2, 2));
        assert_eq!(db.all_match_states().unwrap().len(), 2);
    }

    #[test]
    fn test_legacy_match_states_are_split_by_audience() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE match_states (
                match_id TEXT PRIMARY KEY, home_score INTEGER NOT NULL, away_score INTEGER NOT NULL,
                status TEXT NOT NULL, details_hash TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL, updated_at TEXT NOT NULL
             );
             INSERT INTO match_states VALUES ('9', 2, 1, 'halftime', '[]', 5, '2026-05-01 15:45:00.000+00:00');",
        )
        .unwrap();

        let db = Database::from_connection(conn).unwrap();
        for audience in [Audience::All, Audience::Team] {
            let stored = db.get_match_state("9", audience).unwrap().unwrap();
            assert_eq!(stored.audience, audience);
            assert_eq!((stored.home_score, stored.away_score), (2, 1));
            assert_eq!(stored.status, MatchPhase::Halftime);
            assert_eq!(stored.version, 5);
        }
    }

    #[test]
    fn test_notification_details_lifecycle() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_details(12, &details("a")).unwrap();
        db.upsert_details(12, &details("b")).unwrap();
        db.upsert_details(7, &details("c")).unwrap();

        assert_eq!(db.get_details(12).unwrap(), Some(details("b")));
        let fids: Vec<u64> = db.all_subscribers().unwrap().iter().map(|r| r.fid).collect();
        assert_eq!(fids, vec![7, 12]);

        db.remove_details(12).unwrap();
        assert!(db.get_details(12).unwrap().is_none());
        assert_eq!(db.all_subscribers().unwrap().len(), 1);
    }

    #[test]
    fn test_team_subscribers_require_details_and_matching_team() {
        let db = Database::open(":memory:").unwrap();
        db.upsert_details(1, &details("t1")).unwrap();
        db.upsert_details(2, &details("t2")).unwrap();
        db.replace_teams(1, &["359".into()]).unwrap();
        db.replace_teams(2, &["363".into(), "364".into()]).unwrap();
        // Follows a playing team but has notifications disabled
        db.replace_teams(3, &["359".into()]).unwrap();

        let fans: Vec<u64> = db
            .team_subscribers(&["359", "382"])
            .unwrap()
            .iter()
            .map(|r| r.fid)
            .collect();
        assert_eq!(fans, vec![1]);

        db.replace_teams(2, &["382".into()]).unwrap();
        assert_eq!(db.get_teams(2).unwrap(), vec!["382".to_string()]);
        assert_eq!(db.team_subscribers(&["359", "382"]).unwrap().len(), 2);
        assert!(db.team_subscribers(&[]).unwrap().is_empty());
    }
}
