use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::JobRunState;

/// Initialise the run-state schema in `conn`.
///
/// One row per job name. Specs are never stored here: they come from config
/// or the management calls, only the bookkeeping survives a restart.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_state (
            name            TEXT    NOT NULL PRIMARY KEY,
            last_run        TEXT,               -- RFC 3339 or NULL
            run_count       INTEGER NOT NULL DEFAULT 0,
            next_fire_time  TEXT,               -- RFC 3339 or NULL
            consumed        TEXT    NOT NULL DEFAULT '[]',  -- JSON array of RFC 3339
            skip_explicit   TEXT    NOT NULL DEFAULT '[]',
            run_explicit    TEXT    NOT NULL DEFAULT '[]',
            updated_at      TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// SQLite-backed persistence of [`JobRunState`].
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Upsert the persisted subset of `state`.
    pub fn save(&self, name: &str, state: &JobRunState) -> Result<()> {
        let encode = |instants: &[DateTime<Utc>]| {
            serde_json::to_string(instants).map_err(|e| SchedulerError::CorruptState {
                name: name.to_string(),
                reason: e.to_string(),
            })
        };
        self.conn.execute(
            "INSERT INTO job_state
                (name, last_run, run_count, next_fire_time, consumed, skip_explicit, run_explicit, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                last_run = excluded.last_run,
                run_count = excluded.run_count,
                next_fire_time = excluded.next_fire_time,
                consumed = excluded.consumed,
                skip_explicit = excluded.skip_explicit,
                run_explicit = excluded.run_explicit,
                updated_at = excluded.updated_at",
            rusqlite::params![
                name,
                state.last_run.map(|t| t.to_rfc3339()),
                state.run_count as i64,
                state.next_fire_time.map(|t| t.to_rfc3339()),
                encode(&state.consumed)?,
                encode(&state.skip_explicit)?,
                encode(&state.run_explicit)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(job = %name, run_count = state.run_count, "run-state saved");
        Ok(())
    }

    /// Load the stored state for `name`, if any. `started`, the catch-up flag
    /// and any splay hold are per-process and always come back cleared.
    pub fn load(&self, name: &str) -> Result<Option<JobRunState>> {
        let row = self
            .conn
            .query_row(
                "SELECT last_run, run_count, next_fire_time, consumed, skip_explicit, run_explicit
                 FROM job_state WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?, // last_run
                        row.get::<_, i64>(1)?,            // run_count
                        row.get::<_, Option<String>>(2)?, // next_fire_time
                        row.get::<_, String>(3)?,         // consumed JSON
                        row.get::<_, String>(4)?,         // skip_explicit JSON
                        row.get::<_, String>(5)?,         // run_explicit JSON
                    ))
                },
            )
            .optional()?;

        let Some((last_run, run_count, next_fire_time, consumed, skip_explicit, run_explicit)) = row
        else {
            return Ok(None);
        };

        let corrupt = |reason: String| SchedulerError::CorruptState {
            name: name.to_string(),
            reason,
        };
        let decode = |raw: &str| -> Result<Vec<DateTime<Utc>>> {
            serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))
        };

        Ok(Some(JobRunState {
            last_run: parse_ts(last_run.as_deref()).map_err(corrupt)?,
            run_count: u64::try_from(run_count).map_err(|e| corrupt(e.to_string()))?,
            next_fire_time: parse_ts(next_fire_time.as_deref()).map_err(corrupt)?,
            consumed: decode(&consumed)?,
            skip_explicit: decode(&skip_explicit)?,
            run_explicit: decode(&run_explicit)?,
            ..JobRunState::default()
        }))
    }

    /// Returns whether a row was deleted.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM job_state WHERE name = ?1", [name])?;
        Ok(n > 0)
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM job_state ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

fn parse_ts(raw: Option<&str>) -> std::result::Result<Option<DateTime<Utc>>, String> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("bad timestamp {s:?}: {e}"))
    })
    .transpose()
}
