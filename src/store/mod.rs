//! Durable event storage over SQLite.
//!
//! One connection per calling thread (`thread_local!`), each opened with
//! WAL journaling and a busy timeout so concurrent readers never block on a
//! writer. Writes additionally serialize through a single mutex, mirroring
//! the original's one `threading.Lock` guarding every write path.

use crate::error::StoreError;
use crate::rules::types::{
    EventId, EventState, EventType, Pi, Severity, StationEvent, TranscriptionStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    type         TEXT NOT NULL,
    severity     TEXT NOT NULL,
    state        TEXT NOT NULL,
    pi           TEXT NOT NULL,
    station_ps   TEXT,
    frequency    TEXT,
    radiotext    TEXT NOT NULL DEFAULT '[]',
    data         TEXT NOT NULL DEFAULT '{}',
    started_at   TEXT,
    ended_at     TEXT,
    duration_sec INTEGER,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at);
CREATE INDEX IF NOT EXISTS idx_events_pi ON events(pi);
CREATE INDEX IF NOT EXISTS idx_events_state ON events(state);
";

/// Additive columns introduced after the original schema; applied with
/// `ALTER TABLE ... ADD COLUMN`, ignoring SQLite's duplicate-column error.
const MIGRATIONS: &[(&str, &str)] = &[
    ("audio_path", "TEXT"),
    ("transcription", "TEXT"),
    ("transcription_status", "TEXT"),
    ("transcription_duration_sec", "REAL"),
];

pub struct EventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

thread_local! {
    static CONN: RefCell<Option<(PathBuf, Connection)>> = const { RefCell::new(None) };
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let store = EventStore {
            path: path.clone(),
            write_lock: Mutex::new(()),
        };
        store.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            for (name, decl) in MIGRATIONS {
                let sql = format!("ALTER TABLE events ADD COLUMN {name} {decl}");
                match conn.execute(&sql, []) {
                    Ok(_) => {}
                    Err(rusqlite::Error::SqliteFailure(_, Some(msg)))
                        if msg.contains("duplicate column name") => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>) -> Result<T, StoreError> {
        CONN.with(|cell| {
            let mut slot = cell.borrow_mut();
            let needs_open = match &*slot {
                Some((p, _)) => p != &self.path,
                None => true,
            };
            if needs_open {
                let conn = Connection::open(&self.path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
                *slot = Some((self.path.clone(), conn));
            }
            let conn = &slot.as_ref().unwrap().1;
            f(conn).map_err(StoreError::from)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_event(
        &self,
        pi: &str,
        event_type: EventType,
        severity: Severity,
        state: EventState,
        station_ps: Option<&str>,
        frequency: Option<&str>,
        started_at: Option<&str>,
        data: &serde_json::Value,
    ) -> Result<EventId, StoreError> {
        let _guard = self.write_lock.lock();
        let created_at = now_iso();
        let data_json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (type, severity, state, pi, station_ps, frequency, radiotext, data, started_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', ?7, ?8, ?9)",
                params![
                    event_type.to_string(),
                    severity.to_string(),
                    state.to_string(),
                    pi,
                    station_ps,
                    frequency,
                    data_json,
                    started_at,
                    created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Replaces the RadioText sequence and moves the event to `update`.
    pub fn update_radiotext(&self, id: EventId, radiotext: &[String]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let encoded = serde_json::to_string(radiotext).unwrap_or_else(|_| "[]".to_string());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE events SET radiotext = ?1, state = 'update' WHERE id = ?2",
                params![encoded, id],
            )?;
            Ok(())
        })
    }

    /// Atomically finalizes an event: sets `ended_at`, `duration_sec`, state
    /// `end`, and optionally replaces `radiotext`/`data` in the same update.
    pub fn end_event(
        &self,
        id: EventId,
        ended_at: &str,
        duration_sec: i64,
        radiotext: Option<&[String]>,
        data: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let radiotext_json = radiotext.map(|rt| serde_json::to_string(rt).unwrap_or_else(|_| "[]".to_string()));
        let data_json = data.map(|d| serde_json::to_string(d).unwrap_or_else(|_| "{}".to_string()));
        self.with_conn(|conn| {
            match (&radiotext_json, &data_json) {
                (Some(rt), Some(d)) => conn.execute(
                    "UPDATE events SET state = 'end', ended_at = ?1, duration_sec = ?2, radiotext = ?3, data = ?4 WHERE id = ?5",
                    params![ended_at, duration_sec, rt, d, id],
                ),
                (Some(rt), None) => conn.execute(
                    "UPDATE events SET state = 'end', ended_at = ?1, duration_sec = ?2, radiotext = ?3 WHERE id = ?4",
                    params![ended_at, duration_sec, rt, id],
                ),
                (None, Some(d)) => conn.execute(
                    "UPDATE events SET state = 'end', ended_at = ?1, duration_sec = ?2, data = ?3 WHERE id = ?4",
                    params![ended_at, duration_sec, d, id],
                ),
                (None, None) => conn.execute(
                    "UPDATE events SET state = 'end', ended_at = ?1, duration_sec = ?2 WHERE id = ?3",
                    params![ended_at, duration_sec, id],
                ),
            }?;
            Ok(())
        })
    }

    pub fn update_audio(&self, id: EventId, audio_path: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.with_conn(|conn| {
            conn.execute("UPDATE events SET audio_path = ?1 WHERE id = ?2", params![audio_path, id])?;
            Ok(())
        })
    }

    pub fn update_transcription_status(&self, id: EventId, status: TranscriptionStatus) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE events SET transcription_status = ?1 WHERE id = ?2",
                params![status.to_string(), id],
            )?;
            Ok(())
        })
    }

    pub fn clear_transcription_status(&self, id: EventId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.with_conn(|conn| {
            conn.execute("UPDATE events SET transcription_status = NULL WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn update_transcription(
        &self,
        id: EventId,
        text: &str,
        status: TranscriptionStatus,
        duration_sec: Option<f64>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE events SET transcription = ?1, transcription_status = ?2, transcription_duration_sec = ?3 WHERE id = ?4",
                params![text, status.to_string(), duration_sec, id],
            )?;
            Ok(())
        })
    }

    /// Direct lookup by id. Preferred over scanning `query`'s results,
    /// which is unreliable if newer events were inserted concurrently.
    pub fn get(&self, id: EventId) -> Result<StationEvent, StoreError> {
        self.with_conn(|conn| conn.query_row("SELECT * FROM events WHERE id = ?1", params![id], row_to_event))
            .and_then(|opt| opt.ok_or(StoreError::NotFound(id)))
            .or_else(|e| match e {
                StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound(id)),
                other => Err(other),
            })
    }

    /// Ordered by `created_at` descending; `limit` is clamped to 200.
    pub fn query(
        &self,
        type_filter: Option<&str>,
        since: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<StationEvent>, i64), StoreError> {
        let limit = limit.clamp(1, 200);
        self.with_conn(|conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(t) = type_filter {
                clauses.push("type = ?".to_string());
                values.push(Box::new(t.to_string()));
            }
            if let Some(s) = since {
                clauses.push("created_at > ?".to_string());
                values.push(Box::new(s.to_string()));
            }
            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };

            let count_sql = format!("SELECT COUNT(*) FROM events{where_clause}");
            let total: i64 = conn.query_row(&count_sql, params_from_iter(values.iter().map(|v| v.as_ref())), |row| row.get(0))?;

            let mut select_values = values;
            select_values.push(Box::new(limit));
            select_values.push(Box::new(offset));
            let select_sql = format!("SELECT * FROM events{where_clause} ORDER BY created_at DESC LIMIT ? OFFSET ?");
            let mut stmt = conn.prepare(&select_sql)?;
            let mapped = stmt.query_map(params_from_iter(select_values.iter().map(|v| v.as_ref())), row_to_event)?;
            let mut rows = Vec::new();
            for r in mapped {
                if let Some(ev) = r? {
                    rows.push(ev);
                }
            }
            Ok((rows, total))
        })
    }

    /// All events currently in a non-terminal state (`start`, `update`, `active`).
    pub fn get_active(&self) -> Result<Vec<StationEvent>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM events WHERE state IN ('start', 'update', 'active') ORDER BY created_at DESC",
            )?;
            collect(stmt.query_map([], row_to_event)?)
        })
    }

    pub fn get_active_events(&self, pi: &str) -> Result<Vec<StationEvent>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM events WHERE pi = ?1 AND state IN ('start', 'update', 'active') ORDER BY created_at DESC",
            )?;
            collect(stmt.query_map(params![pi], row_to_event)?)
        })
    }

    pub fn get_active_traffic(&self, pi: &str) -> Result<Option<StationEvent>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM events WHERE pi = ?1 AND type = 'traffic' AND state IN ('start', 'update') \
                 ORDER BY created_at DESC LIMIT 1",
                params![pi],
                row_to_event,
            )
            .optional()
            .map(|opt| opt.flatten())
        })
    }

    pub fn get_active_emergency(&self, pi: &str) -> Result<Option<StationEvent>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM events WHERE pi = ?1 AND type = 'emergency' AND state = 'active' \
                 ORDER BY created_at DESC LIMIT 1",
                params![pi],
                row_to_event,
            )
            .optional()
            .map(|opt| opt.flatten())
        })
    }

    /// Marks any non-terminal event as ended on startup, recovering from an
    /// unclean shutdown where the process died mid-announcement (I5).
    pub fn close_stale_on_startup(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        let now = now_iso();
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE events SET state = 'end', ended_at = ?1, duration_sec = 0 \
                 WHERE state IN ('start', 'update', 'active')",
                params![now],
            )?;
            Ok(n)
        })
    }

    pub fn delete(&self, id: EventId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM events WHERE id = ?1", params![id])? > 0))
    }

    /// Deletes events older than `retention_days`, returning the `audio_path`
    /// (Ogg filename) of every deleted row that had one, so the caller can
    /// remove both the Ogg and WAV artifacts outside of this store's lock.
    pub fn purge_older_than(&self, retention_days: u32) -> Result<Vec<String>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let cutoff = cutoff.format("%Y-%m-%dT%H:%M:%S").to_string();
        let _guard = self.write_lock.lock();
        let paths = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT audio_path FROM events WHERE created_at < ?1 AND audio_path IS NOT NULL")?;
            let mapped = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for r in mapped {
                out.push(r?);
            }
            Ok(out)
        })?;
        self.with_conn(|conn| {
            conn.execute("DELETE FROM events WHERE created_at < ?1", params![cutoff])?;
            Ok(())
        })?;
        Ok(paths)
    }

    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM events", [])?))
    }
}

fn collect(mapped: rusqlite::MappedRows<impl FnMut(&Row) -> Result<Option<StationEvent>, rusqlite::Error>>) -> Result<Vec<StationEvent>, rusqlite::Error> {
    let mut rows = Vec::new();
    for r in mapped {
        if let Some(ev) = r? {
            rows.push(ev);
        }
    }
    Ok(rows)
}

fn row_to_event(row: &Row) -> Result<Option<StationEvent>, rusqlite::Error> {
    let event_type: String = row.get("type")?;
    let severity: String = row.get("severity")?;
    let state: String = row.get("state")?;
    let transcription_status: Option<String> = row.get("transcription_status")?;
    let radiotext_raw: String = row.get("radiotext")?;
    let data_raw: String = row.get("data")?;

    let Some(event_type) = EventType::from_str(&event_type) else { return Ok(None) };
    let severity = match severity.as_str() {
        "warning" => Severity::Warning,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };
    let Some(state) = EventState::from_str(&state) else { return Ok(None) };
    let transcription_status = transcription_status.and_then(|s| TranscriptionStatus::from_str(&s));

    Ok(Some(StationEvent {
        id: row.get("id")?,
        pi: row.get::<_, String>("pi")? as Pi,
        event_type,
        severity,
        state,
        station_ps: row.get("station_ps")?,
        frequency: row.get("frequency")?,
        radiotext: serde_json::from_str(&radiotext_raw).unwrap_or_default(),
        data: serde_json::from_str(&data_raw).unwrap_or(serde_json::Value::Null),
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        duration_sec: row.get("duration_sec")?,
        audio_path: row.get("audio_path")?,
        transcription: row.get("transcription")?,
        transcription_status,
        transcription_duration_sec: row.get("transcription_duration_sec")?,
        created_at: row.get("created_at")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> EventStore {
        let path = std::env::temp_dir().join(format!(
            "rds_guard_store_test_{}_{}.sqlite",
            std::process::id(),
            rand_suffix()
        ));
        let _ = std::fs::remove_file(&path);
        EventStore::open(path).unwrap()
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    #[test]
    fn insert_then_get_round_trips() {
        let store = temp_store();
        let id = store
            .insert_event(
                "12345",
                EventType::Traffic,
                Severity::Warning,
                EventState::Start,
                Some("P4"),
                Some("103.5M"),
                Some("2025-01-01T00:00:00"),
                &serde_json::json!({}),
            )
            .unwrap();
        let ev = store.get(id).unwrap();
        assert_eq!(ev.pi, "12345");
        assert_eq!(ev.event_type, EventType::Traffic);
        assert_eq!(ev.severity, Severity::Warning);
        assert_eq!(ev.state, EventState::Start);
        assert_eq!(ev.station_ps.as_deref(), Some("P4"));
        assert!(ev.ended_at.is_none());
    }

    #[test]
    fn end_event_sets_ended_at_and_duration_atomically() {
        let store = temp_store();
        let id = store
            .insert_event("12345", EventType::Traffic, Severity::Warning, EventState::Start, None, None, Some("2025-01-01T00:00:00"), &serde_json::Value::Null)
            .unwrap();
        store.end_event(id, "2025-01-01T00:00:30", 30, None, None).unwrap();
        let ev = store.get(id).unwrap();
        assert_eq!(ev.state, EventState::End);
        assert_eq!(ev.duration_sec, Some(30));
        assert!(ev.ended_at.is_some());
    }

    #[test]
    fn get_missing_event_returns_not_found() {
        let store = temp_store();
        assert!(matches!(store.get(9999), Err(StoreError::NotFound(9999))));
    }

    #[test]
    fn close_stale_on_startup_ends_non_terminal_rows() {
        let store = temp_store();
        let id = store
            .insert_event("12345", EventType::Emergency, Severity::Critical, EventState::Active, None, None, None, &serde_json::Value::Null)
            .unwrap();
        let n = store.close_stale_on_startup().unwrap();
        assert_eq!(n, 1);
        let ev = store.get(id).unwrap();
        assert_eq!(ev.state, EventState::End);
    }

    #[test]
    fn query_filters_by_type_and_reports_total() {
        let store = temp_store();
        store.insert_event("1", EventType::Traffic, Severity::Warning, EventState::Start, None, None, None, &serde_json::Value::Null).unwrap();
        store.insert_event("2", EventType::EonTraffic, Severity::Info, EventState::Received, None, None, None, &serde_json::Value::Null).unwrap();

        let (rows, total) = store.query(Some("traffic"), None, 50, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, EventType::Traffic);
    }

    #[test]
    fn purge_older_than_removes_rows_and_returns_audio_paths() {
        let store = temp_store();
        let id = store.insert_event("1", EventType::Traffic, Severity::Warning, EventState::End, None, None, None, &serde_json::Value::Null).unwrap();
        store.update_audio(id, "1.ogg").unwrap();
        // A huge retention window means nothing is old enough to purge yet.
        let paths = store.purge_older_than(3650).unwrap();
        assert!(paths.is_empty());
        assert!(store.get(id).is_ok());
    }
}
