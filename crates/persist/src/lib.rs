//! Keel persistence: the key-value store contract on SQLite.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use keel_core::config::Tunables;
use keel_store::{
    KeyValue, KvStore, Revision, StoreError, StoreEvent, StoreEventKind, StoreResult, StoreWatch, WatchHub,
};
use metrics::{counter, histogram};
use rusqlite::{OptionalExtension, Transaction};
use tracing::info;

struct Inner {
    db: rusqlite::Connection,
    hub: WatchHub,
}

/// SQLite-backed store. Simple, synchronous under one connection lock; watch
/// history is in-process only and starts empty on open.
pub struct SqliteStore {
    inner: Mutex<Inner>,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db, &Tunables::from_env())
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, &Tunables::default())
    }

    fn init(db: rusqlite::Connection, t: &Tunables) -> Result<Self> {
        let started = std::time::Instant::now();
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                create_rev INTEGER NOT NULL,
                mod_rev    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating kv table")?;
        db.execute("CREATE TABLE IF NOT EXISTS meta (id INTEGER PRIMARY KEY CHECK (id = 0), revision INTEGER NOT NULL)", [])
            .context("creating meta table")?;
        db.execute("INSERT OR IGNORE INTO meta(id, revision) VALUES (0, 0)", []).context("seeding revision")?;
        let rev: i64 = db.query_row("SELECT revision FROM meta WHERE id = 0", [], |r| r.get(0)).context("reading revision")?;
        info!(revision = rev, "persist: sqlite store opened");
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { inner: Mutex::new(Inner { db, hub: WatchHub::new(t) }) })
    }

    fn inner(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Backend("sqlite store lock poisoned".into()))
    }
}

fn read_revision(db: &rusqlite::Connection) -> StoreResult<Revision> {
    let rev: i64 = db.query_row("SELECT revision FROM meta WHERE id = 0", [], |r| r.get(0)).map_err(backend)?;
    Ok(rev as Revision)
}

fn bump_revision(tx: &Transaction<'_>) -> StoreResult<Revision> {
    let next = read_revision(tx)? + 1;
    tx.execute("UPDATE meta SET revision = ?1 WHERE id = 0", [next as i64]).map_err(backend)?;
    Ok(next)
}

fn row_kv(key: &str, r: &rusqlite::Row<'_>) -> rusqlite::Result<KeyValue> {
    let create: i64 = r.get(1)?;
    let modified: i64 = r.get(2)?;
    Ok(KeyValue { key: key.to_string(), value: r.get(0)?, create_revision: create as Revision, mod_revision: modified as Revision })
}

fn fetch(db: &rusqlite::Connection, key: &str) -> StoreResult<Option<KeyValue>> {
    db.query_row("SELECT value, create_rev, mod_rev FROM kv WHERE key = ?1", [key], |r| row_kv(key, r))
        .optional()
        .map_err(backend)
}

fn check_expected(key: &str, cur: &KeyValue, expected: Option<Revision>) -> StoreResult<()> {
    match expected {
        Some(exp) if exp != cur.mod_revision => {
            Err(StoreError::RevisionMismatch { key: key.to_string(), expected: exp, actual: cur.mod_revision })
        }
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let inner = self.inner()?;
        fetch(&inner.db, key)
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StoreResult<KeyValue> {
        let started = std::time::Instant::now();
        let mut guard = self.inner()?;
        let inner = &mut *guard;
        let tx = inner.db.transaction().map_err(backend)?;
        let exists: Option<i64> = tx.query_row("SELECT 1 FROM kv WHERE key = ?1", [key], |r| r.get(0)).optional().map_err(backend)?;
        if exists.is_some() {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        let rev = bump_revision(&tx)?;
        tx.execute(
            "INSERT INTO kv(key, value, create_rev, mod_rev) VALUES (?1, ?2, ?3, ?3)",
            (key, &value, rev as i64),
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        inner.hub.publish(StoreEvent { kind: StoreEventKind::Put, key: key.to_string(), value: Some(value.clone()), prev_value: None, revision: rev });
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_writes_total", 1u64, "op" => "create");
        Ok(KeyValue { key: key.to_string(), value, create_revision: rev, mod_revision: rev })
    }

    async fn update(&self, key: &str, value: Vec<u8>, expected: Option<Revision>) -> StoreResult<KeyValue> {
        let started = std::time::Instant::now();
        let mut guard = self.inner()?;
        let inner = &mut *guard;
        let tx = inner.db.transaction().map_err(backend)?;
        let cur = fetch(&tx, key)?.ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        check_expected(key, &cur, expected)?;
        let rev = bump_revision(&tx)?;
        tx.execute("UPDATE kv SET value = ?2, mod_rev = ?3 WHERE key = ?1", (key, &value, rev as i64)).map_err(backend)?;
        tx.commit().map_err(backend)?;
        inner.hub.publish(StoreEvent { kind: StoreEventKind::Put, key: key.to_string(), value: Some(value.clone()), prev_value: Some(cur.value), revision: rev });
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_writes_total", 1u64, "op" => "update");
        Ok(KeyValue { key: key.to_string(), value, create_revision: cur.create_revision, mod_revision: rev })
    }

    async fn delete(&self, key: &str, expected: Option<Revision>) -> StoreResult<KeyValue> {
        let mut guard = self.inner()?;
        let inner = &mut *guard;
        let tx = inner.db.transaction().map_err(backend)?;
        let cur = fetch(&tx, key)?.ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        check_expected(key, &cur, expected)?;
        let rev = bump_revision(&tx)?;
        tx.execute("DELETE FROM kv WHERE key = ?1", [key]).map_err(backend)?;
        tx.commit().map_err(backend)?;
        inner.hub.publish(StoreEvent { kind: StoreEventKind::Delete, key: key.to_string(), value: None, prev_value: Some(cur.value.clone()), revision: rev });
        counter!("store_writes_total", 1u64, "op" => "delete");
        Ok(cur)
    }

    async fn list(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)> {
        let started = std::time::Instant::now();
        let guard = self.inner()?;
        let rev = read_revision(&guard.db)?;
        let items = {
            let mut stmt = guard
                .db
                .prepare("SELECT key, value, create_rev, mod_rev FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
                .map_err(backend)?;
            let mut rows = stmt.query([prefix]).map_err(backend)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(backend)? {
                let key: String = row.get(0).map_err(backend)?;
                let create: i64 = row.get(2).map_err(backend)?;
                let modified: i64 = row.get(3).map_err(backend)?;
                out.push(KeyValue { key, value: row.get(1).map_err(backend)?, create_revision: create as Revision, mod_revision: modified as Revision });
            }
            out
        };
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok((items, rev))
    }

    async fn watch(&self, prefix: &str, from: Revision) -> StoreResult<StoreWatch> {
        let sub = {
            let guard = self.inner()?;
            let current = read_revision(&guard.db)?;
            guard.hub.subscribe(prefix, from, current)?
        };
        Ok(sub.spawn())
    }

    async fn revision(&self) -> StoreResult<Revision> {
        let inner = self.inner()?;
        read_revision(&inner.db)
    }

    fn watchers(&self) -> StoreResult<usize> {
        Ok(self.inner()?.hub.watchers())
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
