//! SQLite-backed history store.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Thread-safe store. One mutexed connection: conflicting writes from
/// concurrent endpoint cycles serialize here.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Endpoint CRUD ---

    /// Register an endpoint for tracking. No-op if already present.
    pub fn add_endpoint(&self, endpoint: &Endpoint) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO endpoints (address, name, last_label, failure_count, notifications_enabled, last_transition)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                endpoint.address,
                endpoint.name,
                endpoint.last_label,
                endpoint.failure_count,
                endpoint.notifications_enabled as i64,
                endpoint.last_transition.map(|t| t.format(TIME_FORMAT).to_string()),
            ],
        )?;
        Ok(())
    }

    /// Get all tracked endpoints.
    pub fn get_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT address, name, last_label, failure_count, notifications_enabled, last_transition FROM endpoints",
        )?;

        let endpoints = stmt
            .query_map([], row_to_endpoint)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(endpoints)
    }

    /// Get one endpoint by address.
    pub fn get_endpoint(&self, address: &str) -> Result<Endpoint, StoreError> {
        let conn = self.conn.lock().unwrap();
        let endpoint = conn.query_row(
            "SELECT address, name, last_label, failure_count, notifications_enabled, last_transition
             FROM endpoints WHERE address = ?1",
            params![address],
            row_to_endpoint,
        )?;
        Ok(endpoint)
    }

    /// Remove an endpoint and everything keyed to it.
    pub fn remove_endpoint(&self, address: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM activity_history WHERE address = ?1", params![address])?;
        conn.execute("DELETE FROM delivery_targets WHERE address = ?1", params![address])?;
        conn.execute("DELETE FROM endpoints WHERE address = ?1", params![address])?;
        Ok(())
    }

    /// Last label observed online for an endpoint, "unknown" if never seen.
    pub fn get_last_label(&self, address: &str) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        let label: Option<String> = conn
            .query_row(
                "SELECT last_label FROM endpoints WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(label.unwrap_or_else(|| UNKNOWN_LABEL.to_string()))
    }

    /// Record a label transition on the endpoint row.
    pub fn set_last_label(
        &self,
        address: &str,
        label: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        set_last_label_on(&conn, address, label, when)?;
        Ok(())
    }

    /// Persist the consecutive-failure count so a restart resumes from it.
    pub fn set_failure_count(&self, address: &str, count: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE endpoints SET failure_count = ?1 WHERE address = ?2",
            params![count, address],
        )?;
        Ok(())
    }

    /// Toggle whether transitions on this endpoint reach subscribers.
    pub fn set_notifications_enabled(&self, address: &str, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE endpoints SET notifications_enabled = ?1 WHERE address = ?2",
            params![enabled as i64, address],
        )?;
        Ok(())
    }

    // --- Activity history ---

    /// Open a record for a newly-current label. No-op if today's row for
    /// (address, label) already exists, so snapshot replay is harmless.
    pub fn open_record(
        &self,
        address: &str,
        label: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        open_record_on(&conn, address, label, when)?;
        Ok(())
    }

    /// Close the record for a label that just stopped being current:
    /// accumulate its played duration, bump the occurrence count, and store
    /// the final population average for the period.
    pub fn close_record(
        &self,
        address: &str,
        label: &str,
        when: DateTime<Utc>,
        duration_minutes: i64,
        avg_population: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        close_record_on(&conn, address, label, when, duration_minutes, avg_population)?;
        Ok(())
    }

    /// Persist one complete label transition atomically: close the prior
    /// period (when there is one), open the new record, and update the
    /// endpoint's last label in a single transaction. On error nothing is
    /// applied, so the caller can retry the whole transition next tick.
    pub fn record_transition(
        &self,
        address: &str,
        closing: Option<(&str, i64, i64)>,
        new_label: &str,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        if let Some((label, duration_minutes, avg_population)) = closing {
            close_record_on(&tx, address, label, when, duration_minutes, avg_population)?;
        }
        open_record_on(&tx, address, new_label, when)?;
        set_last_label_on(&tx, address, new_label, when)?;

        tx.commit()?;
        Ok(())
    }

    /// Refresh the running population average for the currently-open record.
    pub fn append_sample(
        &self,
        address: &str,
        label: &str,
        when: DateTime<Utc>,
        avg_population: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE activity_history
             SET avg_population = ?1, last_observed = ?2
             WHERE address = ?3 AND label = ?4 AND day = ?5",
            params![
                avg_population,
                when.format(TIME_FORMAT).to_string(),
                address,
                label,
                when.format(DAY_FORMAT).to_string(),
            ],
        )?;
        Ok(())
    }

    /// Full activity history for an endpoint, most recent first.
    pub fn get_records(&self, address: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT address, label, day, playtime_minutes, occurrences, avg_population, last_observed
             FROM activity_history WHERE address = ?1 ORDER BY last_observed DESC",
        )?;

        let records = stmt
            .query_map(params![address], |row| {
                let time_str: String = row.get(6)?;
                Ok(ActivityRecord {
                    address: row.get(0)?,
                    label: row.get(1)?,
                    day: row.get(2)?,
                    playtime_minutes: row.get(3)?,
                    occurrences: row.get(4)?,
                    avg_population: row.get(5)?,
                    last_observed: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    // --- Subscriptions ---

    /// Interest patterns for one subscriber.
    pub fn get_subscriptions(&self, subscriber_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT pattern FROM subscriptions WHERE subscriber_id = ?1")?;
        let patterns = stmt
            .query_map(params![subscriber_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(patterns)
    }

    /// Every subscription in the store, for fan-out matching.
    pub fn all_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT subscriber_id, pattern FROM subscriptions")?;
        let subscriptions = stmt
            .query_map([], |row| {
                Ok(Subscription {
                    subscriber_id: row.get(0)?,
                    pattern: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(subscriptions)
    }

    /// Bulk-edit a subscriber's patterns: merge new ones in, or delete the
    /// named ones when `delete` is set.
    pub fn put_subscriptions(
        &self,
        subscriber_id: i64,
        patterns: &[String],
        delete: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        {
            let sql = if delete {
                "DELETE FROM subscriptions WHERE subscriber_id = ?1 AND pattern = ?2"
            } else {
                "INSERT OR IGNORE INTO subscriptions (subscriber_id, pattern) VALUES (?1, ?2)"
            };
            let mut stmt = tx.prepare(sql)?;
            for pattern in patterns {
                stmt.execute(params![subscriber_id, pattern])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // --- Delivery targets ---

    /// Track an endpoint for a group, rendering into the given sink.
    pub fn add_delivery_target(&self, target: &DeliveryTarget) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO delivery_targets (address, group_id, sink_id, last_message_ref)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(address, group_id) DO UPDATE SET
             sink_id=excluded.sink_id, last_message_ref=excluded.last_message_ref",
            params![
                target.address,
                target.group_id,
                target.sink_id,
                target.last_message_ref,
            ],
        )?;
        Ok(())
    }

    /// All delivery targets for an endpoint.
    pub fn get_delivery_targets(&self, address: &str) -> Result<Vec<DeliveryTarget>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT address, group_id, sink_id, last_message_ref FROM delivery_targets WHERE address = ?1",
        )?;

        let targets = stmt
            .query_map(params![address], |row| {
                Ok(DeliveryTarget {
                    address: row.get(0)?,
                    group_id: row.get(1)?,
                    sink_id: row.get(2)?,
                    last_message_ref: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Untrack an endpoint for one group.
    pub fn remove_delivery_target(&self, address: &str, group_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM delivery_targets WHERE address = ?1 AND group_id = ?2",
            params![address, group_id],
        )?;
        Ok(())
    }

    /// Drop every delivery target for an endpoint (abandonment path).
    pub fn remove_delivery_targets(&self, address: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM delivery_targets WHERE address = ?1", params![address])?;
        Ok(())
    }

    /// Record the replacement message reference after a sink re-rendered.
    pub fn update_message_ref(
        &self,
        address: &str,
        group_id: i64,
        message_ref: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE delivery_targets SET last_message_ref = ?1 WHERE address = ?2 AND group_id = ?3",
            params![message_ref, address, group_id],
        )?;
        Ok(())
    }
}

fn open_record_on(
    conn: &Connection,
    address: &str,
    label: &str,
    when: DateTime<Utc>,
) -> SqlResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO activity_history (address, label, day, playtime_minutes, occurrences, avg_population, last_observed)
         VALUES (?1, ?2, ?3, 0, 0, 0, ?4)",
        params![
            address,
            label,
            when.format(DAY_FORMAT).to_string(),
            when.format(TIME_FORMAT).to_string(),
        ],
    )?;
    Ok(())
}

fn close_record_on(
    conn: &Connection,
    address: &str,
    label: &str,
    when: DateTime<Utc>,
    duration_minutes: i64,
    avg_population: i64,
) -> SqlResult<()> {
    let day = when.format(DAY_FORMAT).to_string();
    let updated = conn.execute(
        "UPDATE activity_history
         SET playtime_minutes = playtime_minutes + ?1,
             occurrences = occurrences + 1,
             avg_population = ?2,
             last_observed = ?3
         WHERE address = ?4 AND label = ?5 AND day = ?6",
        params![
            duration_minutes,
            avg_population,
            when.format(TIME_FORMAT).to_string(),
            address,
            label,
            day,
        ],
    )?;

    // A period can straddle midnight; the open row then lives under an
    // earlier day bucket. Insert today's row directly in that case.
    if updated == 0 {
        conn.execute(
            "INSERT INTO activity_history (address, label, day, playtime_minutes, occurrences, avg_population, last_observed)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
            params![
                address,
                label,
                day,
                duration_minutes,
                avg_population,
                when.format(TIME_FORMAT).to_string(),
            ],
        )?;
    }
    Ok(())
}

fn set_last_label_on(
    conn: &Connection,
    address: &str,
    label: &str,
    when: DateTime<Utc>,
) -> SqlResult<()> {
    conn.execute(
        "UPDATE endpoints SET last_label = ?1, last_transition = ?2 WHERE address = ?3",
        params![label, when.format(TIME_FORMAT).to_string(), address],
    )?;
    Ok(())
}

fn row_to_endpoint(row: &rusqlite::Row<'_>) -> SqlResult<Endpoint> {
    let notif: i64 = row.get(4)?;
    let transition: Option<String> = row.get(5)?;
    Ok(Endpoint {
        address: row.get(0)?,
        name: row.get(1)?,
        last_label: row.get(2)?,
        failure_count: row.get(3)?,
        notifications_enabled: notif != 0,
        last_transition: transition.and_then(|s| parse_db_time(&s)),
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
