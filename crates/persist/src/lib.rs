//! Keel persistence: SQLite history of the values last applied per component.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

/// Rows kept per component.
pub const HISTORY_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastApplied {
    pub component: String,
    /// Generation of the desired-state resource the values were computed from.
    pub generation: i64,
    pub ts: i64,
    pub values_zstd: Vec<u8>,
}

impl LastApplied {
    pub fn new(component: &str, generation: i64, values: &Json) -> Result<Self> {
        let text = serde_json::to_string(values).context("encoding applied values")?;
        Ok(Self { component: component.to_string(), generation, ts: now_ts(), values_zstd: maybe_compress(&text) })
    }

    pub fn values(&self) -> Result<Json> {
        serde_json::from_str(&maybe_decompress(&self.values_zstd))
            .with_context(|| format!("decoding applied values for {}", self.component))
    }
}

pub trait Store: Send + Sync {
    fn put_last(&self, la: LastApplied) -> Result<()>;
    /// Newest first, at most `limit` (default [`HISTORY_DEPTH`]) rows.
    fn get_last(&self, component: &str, limit: Option<usize>) -> Result<Vec<LastApplied>>;
}

/// SQLite-backed store. Simple, synchronous; writes happen once per component per pass.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "persist: opened");
        Ok(me)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS last_applied (
                component  TEXT NOT NULL,
                generation INTEGER NOT NULL,
                ts         INTEGER NOT NULL,
                vals       BLOB NOT NULL
            )",
            [],
        )
        .context("creating last_applied table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_last_applied_component_ts ON last_applied(component, ts DESC)",
            [],
        )
        .ok();
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl Store for SqliteStore {
    fn put_last(&self, la: LastApplied) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO last_applied(component, generation, ts, vals) VALUES (?1, ?2, ?3, ?4)",
            (&la.component, la.generation, la.ts, &la.values_zstd),
        )?;
        // Keep latest HISTORY_DEPTH rows per component
        tx.execute(
            "DELETE FROM last_applied
             WHERE component = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM last_applied WHERE component = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&la.component, HISTORY_DEPTH as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get_last(&self, component: &str, limit: Option<usize>) -> Result<Vec<LastApplied>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(HISTORY_DEPTH);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT generation, ts, vals FROM last_applied WHERE component = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((component, cap as i64))?;
        let mut out: Vec<LastApplied> = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(LastApplied {
                component: component.to_string(),
                generation: row.get(0)?,
                ts: row.get(1)?,
                values_zstd: row.get(2)?,
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

pub fn now_ts() -> i64 { chrono::Utc::now().timestamp() }

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KEEL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    #[allow(unreachable_code)]
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
