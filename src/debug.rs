use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

static OPEN_HANDLES: Lazy<OpenHandles> = Lazy::new(OpenHandles::default);
static DB_STATS: Lazy<DatabaseStats> = Lazy::new(DatabaseStats::default);

#[derive(Debug, Clone, Serialize)]
pub struct HandleState {
    pub path: String,
    pub site: &'static str,
    pub opened_at: DateTime<Utc>,
}

#[derive(Default)]
struct OpenHandles {
    next_id: AtomicU64,
    map: Mutex<HashMap<u64, HandleState>>,
}

/// Registers a live store handle, returning a token for `record_close`.
pub fn record_open(path: &str, site: &'static str) -> u64 {
    let id = OPEN_HANDLES.next_id.fetch_add(1, Ordering::Relaxed);
    OPEN_HANDLES.map.lock().insert(
        id,
        HandleState {
            path: path.to_string(),
            site,
            opened_at: Utc::now(),
        },
    );
    id
}

pub fn record_close(id: u64) {
    if OPEN_HANDLES.map.lock().remove(&id).is_none() {
        tracing::warn!("closing untracked store handle {id}");
    }
}

/// Snapshot of open handles grouped by path, for `/_debug/open`.
pub fn open_handles_snapshot() -> HashMap<String, Vec<HandleState>> {
    let map = OPEN_HANDLES.map.lock();
    let mut snap: HashMap<String, Vec<HandleState>> = HashMap::new();
    for state in map.values() {
        snap.entry(state.path.clone()).or_default().push(state.clone());
    }
    snap
}

#[derive(Default)]
pub struct DbStat {
    written: AtomicU64,
    qlen: AtomicU32,
    opens: AtomicU32,
    closes: AtomicU32,
}

impl DbStat {
    pub fn note_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_qlen(&self, n: u32) {
        self.qlen.store(n, Ordering::Relaxed);
    }

    pub fn note_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Value {
        json!({
            "written": self.written.load(Ordering::Relaxed),
            "qlen": self.qlen.load(Ordering::Relaxed),
            "opens": self.opens.load(Ordering::Relaxed),
            "closes": self.closes.load(Ordering::Relaxed),
        })
    }
}

#[derive(Default)]
struct DatabaseStats {
    map: Mutex<HashMap<String, Arc<DbStat>>>,
}

/// Per-database counters, created on first touch.
pub fn db_stat(name: &str) -> Arc<DbStat> {
    let mut map = DB_STATS.map.lock();
    Arc::clone(map.entry(name.to_string()).or_default())
}

/// Metric dump for `/_debug/vars`.
pub fn vars_snapshot() -> Value {
    let map = DB_STATS.map.lock();
    let dbs: serde_json::Map<String, Value> = map
        .iter()
        .map(|(name, stat)| (name.clone(), stat.snapshot()))
        .collect();
    json!({
        "dbs": dbs,
        "open_handles": OPEN_HANDLES.map.lock().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_tracking_round_trips() {
        let id = record_open("/tmp/x.series", "test");
        assert!(open_handles_snapshot().contains_key("/tmp/x.series"));
        record_close(id);
        let snap = open_handles_snapshot();
        assert!(snap.get("/tmp/x.series").map_or(true, |v| v.is_empty()));
    }

    #[test]
    fn stats_accumulate() {
        let stat = db_stat("stats-test");
        stat.note_written(3);
        stat.note_open();
        stat.note_close();
        stat.set_qlen(7);
        let vars = vars_snapshot();
        let entry = &vars["dbs"]["stats-test"];
        assert_eq!(entry["written"], 3);
        assert_eq!(entry["qlen"], 7);
    }
}
