//! kwatch event sinks: a structured-log sink and an append-only SQLite table.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use kwatch_core::{EventSink, NormalizedEvent, SinkError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------- log sink ----------------

/// Fire-and-forget sink: one `tracing` event per change, target `kwatch::events`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn record(&self, event: &NormalizedEvent) -> Result<(), SinkError> {
        info!(
            target: "kwatch::events",
            event_type = %event.kind,
            resource_type = %event.resource_type,
            resource_group = %event.resource_group,
            namespace = %event.namespace,
            name = %event.name,
            "resource event"
        );
        Ok(())
    }
}

// ---------------- sqlite sink ----------------

/// One stored row of `k8s_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    pub event_type: String,
    pub resource_type: String,
    pub resource_group: String,
    pub namespace: String,
    pub resource_name: String,
    pub observed_at: i64,
}

struct Pool {
    conns: Vec<Mutex<rusqlite::Connection>>,
    next: AtomicUsize,
}

impl Pool {
    /// Grab an idle connection if there is one, else queue on the next in rotation.
    fn get(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, SinkError> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        for i in 0..self.conns.len() {
            if let Ok(guard) = self.conns[(start + i) % self.conns.len()].try_lock() {
                return Ok(guard);
            }
        }
        self.conns[start].lock().map_err(|_| SinkError::Unavailable("sqlite connection mutex poisoned".into()))
    }

    fn insert(&self, ev: &NormalizedEvent) -> Result<(), SinkError> {
        let started = std::time::Instant::now();
        let db = self.get()?;
        db.execute(
            "INSERT INTO k8s_events(event_type, resource_type, resource_group, namespace, resource_name, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (ev.kind.as_str(), &ev.resource_type, &ev.resource_group, &ev.namespace, &ev.name, now_ts()),
        )
        .map_err(|e| SinkError::Write(e.to_string()))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }
}

/// Append-only SQLite sink with a small pool of WAL-mode connections.
/// Writes run on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteSink {
    pool: Arc<Pool>,
}

impl SqliteSink {
    /// Open (and create if needed) the database behind `url`.
    ///
    /// Accepts a bare path or a `sqlite:` / `sqlite://` URL. `:memory:` always
    /// gets a single connection since each in-memory connection is its own database.
    pub fn open(url: &str, pool_size: usize) -> Result<Self> {
        let path = sqlite_path(url);
        let size = if path == ":memory:" { 1 } else { pool_size.max(1) };
        let started = std::time::Instant::now();
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
            db.busy_timeout(Duration::from_secs(5)).context("setting busy timeout")?;
            db.pragma_update(None, "journal_mode", "WAL").ok();
            db.pragma_update(None, "synchronous", "NORMAL").ok();
            conns.push(db);
        }
        conns[0]
            .execute(
                "CREATE TABLE IF NOT EXISTS k8s_events (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type     TEXT NOT NULL,
                    resource_type  TEXT NOT NULL,
                    resource_group TEXT NOT NULL,
                    namespace      TEXT NOT NULL,
                    resource_name  TEXT NOT NULL,
                    observed_at    INTEGER NOT NULL
                )",
                [],
            )
            .context("creating k8s_events table")?;
        conns[0]
            .execute("CREATE INDEX IF NOT EXISTS idx_k8s_events_observed ON k8s_events(observed_at DESC)", [])
            .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path, connections = size, "sqlite event store ready");
        let conns = conns.into_iter().map(Mutex::new).collect();
        Ok(Self { pool: Arc::new(Pool { conns, next: AtomicUsize::new(0) }) })
    }

    /// Synchronous insert of one row.
    pub fn insert(&self, ev: &NormalizedEvent) -> Result<(), SinkError> {
        self.pool.insert(ev)
    }

    /// Most recent rows first.
    pub fn recent(&self, limit: usize) -> Result<Vec<EventRow>> {
        let db = self.pool.get()?;
        let mut stmt = db.prepare(
            "SELECT id, event_type, resource_type, resource_group, namespace, resource_name, observed_at
             FROM k8s_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(EventRow {
                id: row.get(0)?,
                event_type: row.get(1)?,
                resource_type: row.get(2)?,
                resource_group: row.get(3)?,
                namespace: row.get(4)?,
                resource_name: row.get(5)?,
                observed_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        debug!(rows = out.len(), "loaded recent events");
        Ok(out)
    }

    pub fn count(&self) -> Result<i64> {
        let db = self.pool.get()?;
        Ok(db.query_row("SELECT COUNT(*) FROM k8s_events", [], |r| r.get(0))?)
    }
}

#[async_trait::async_trait]
impl EventSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn record(&self, event: &NormalizedEvent) -> Result<(), SinkError> {
        let pool = Arc::clone(&self.pool);
        let ev = event.clone();
        tokio::task::spawn_blocking(move || pool.insert(&ev))
            .await
            .map_err(|e| SinkError::Write(format!("insert task failed: {}", e)))?
    }
}

/// Strip an optional `sqlite:` / `sqlite://` scheme.
pub fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")).unwrap_or(url)
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
