//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Record already exists")]
    Duplicate,
    #[error("Constraint violated: {0}")]
    Constraint(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, msg) = &err {
            if e.code == ErrorCode::ConstraintViolation {
                return match e.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        StoreError::Duplicate
                    }
                    _ => StoreError::Constraint(msg.clone().unwrap_or_else(|| e.to_string())),
                };
            }
        }
        if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
            return StoreError::NotFound;
        }
        StoreError::Sqlite(err)
    }
}

/// Thread-safe database store.
///
/// All access goes through a single connection, which serializes writes from
/// probe pipelines and client requests.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn();

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Hosts ---

    /// Get all hosts.
    pub fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, hostname, online, favorite FROM hosts")?;

        let hosts = stmt
            .query_map([], host_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(hosts)
    }

    /// Get a host by ID.
    pub fn get_host(&self, id: &str) -> Result<Host, StoreError> {
        let conn = self.conn();
        let host = conn.query_row(
            "SELECT id, hostname, online, favorite FROM hosts WHERE id = ?1",
            params![id],
            host_from_row,
        )?;
        Ok(host)
    }

    /// Get a host by its hostname.
    pub fn get_host_by_name(&self, hostname: &str) -> Result<Host, StoreError> {
        let conn = self.conn();
        let host = conn.query_row(
            "SELECT id, hostname, online, favorite FROM hosts WHERE hostname = ?1",
            params![hostname],
            host_from_row,
        )?;
        Ok(host)
    }

    /// Register a new host. Fails with `Duplicate` if the id or hostname is taken.
    pub fn add_host(&self, host: &Host) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO hosts (id, hostname, online, favorite) VALUES (?1, ?2, ?3, ?4)",
            params![host.id, host.hostname, host.online, host.favorite],
        )?;
        Ok(())
    }

    /// Delete a host and, through the cascade, its metric history.
    pub fn delete_host_by_name(&self, hostname: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected =
            conn.execute("DELETE FROM hosts WHERE hostname = ?1", params![hostname])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_favorite_by_name(
        &self,
        hostname: &str,
        favorite: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = conn.execute(
            "UPDATE hosts SET favorite = ?1 WHERE hostname = ?2",
            params![favorite, hostname],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn record_online_status(&self, id: &str, online: bool) -> Result<(), StoreError> {
        let conn = self.conn();
        let affected = conn.execute(
            "UPDATE hosts SET online = ?1 WHERE id = ?2",
            params![online, id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // --- Samples ---

    /// Persist one sample for a host.
    ///
    /// Identical metric shapes share a single marker row; each call adds a new
    /// timestamped entry pointing at it. Runs in one transaction.
    pub fn record_sample(&self, host_id: &str, sample: &Sample) -> Result<(), StoreError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let exists = tx
            .query_row("SELECT 1 FROM hosts WHERE id = ?1", params![host_id], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        // IS instead of = so that NULL columns compare equal.
        let marker_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM markers
                 WHERE latency IS ?1 AND packet_loss IS ?2 AND throughput IS ?3
                   AND dns_resolved IS ?4 AND rtt IS ?5 AND status_code IS ?6",
                params![
                    sample.latency,
                    sample.packet_loss,
                    sample.throughput,
                    sample.dns_resolve_time,
                    sample.rtt,
                    sample.status_code,
                ],
                |row| row.get(0),
            )
            .optional()?;

        let marker_id = match marker_id {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO markers
                         (latency, packet_loss, throughput, dns_resolved, rtt, status_code)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        sample.latency,
                        sample.packet_loss,
                        sample.throughput,
                        sample.dns_resolve_time,
                        sample.rtt,
                        sample.status_code,
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "INSERT INTO metrics (time, host_id, marker_id) VALUES (?1, ?2, ?3)",
            params![sample.time.format(TIME_FORMAT).to_string(), host_id, marker_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Get every sample recorded for a host, oldest first.
    pub fn query_samples_by_host(&self, host_id: &str) -> Result<Vec<Sample>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT m.time, k.latency, k.packet_loss, k.throughput, k.dns_resolved, k.rtt,
                    k.status_code
             FROM metrics m JOIN markers k ON m.marker_id = k.id
             WHERE m.host_id = ?1 ORDER BY m.time ASC, m.id ASC",
        )?;

        let samples = stmt
            .query_map(params![host_id], |row| {
                let time_str: String = row.get(0)?;
                let Some(time) = parse_db_time(&time_str) else {
                    tracing::warn!("Skipping sample of {} with bad time {:?}", host_id, time_str);
                    return Ok(None);
                };
                Ok(Some(Sample {
                    time,
                    latency: row.get(1)?,
                    packet_loss: row.get(2)?,
                    throughput: row.get(3)?,
                    dns_resolve_time: row.get(4)?,
                    rtt: row.get(5)?,
                    status_code: row.get(6)?,
                }))
            })?
            .filter_map(Result::transpose)
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Metric history of a host, looked up by hostname.
    pub fn metrics_by_host(&self, hostname: &str) -> Result<Metrics, StoreError> {
        let host = self.get_host_by_name(hostname)?;
        let samples = self.query_samples_by_host(&host.id)?;
        Ok(Metrics::from_samples(&samples))
    }

    #[cfg(test)]
    fn count(&self, table: &str) -> i64 {
        let conn = self.conn();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }
}

fn host_from_row(row: &Row<'_>) -> SqlResult<Host> {
    Ok(Host {
        id: row.get(0)?,
        hostname: row.get(1)?,
        online: row.get(2)?,
        favorite: row.get(3)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

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
