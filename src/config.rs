use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_ADDR: &str = "127.0.0.1:3133";
pub const DEFAULT_FLUSH_DELAY_MS: u64 = 5_000;
pub const DEFAULT_MAX_OP_QUEUE: usize = 1_000;
pub const DEFAULT_LIVE_TIME_MS: u64 = 60_000;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_CACHE_BACKLOG: usize = 1_000;
pub const DEFAULT_CACHE_WORKERS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub addr: String,
    /// Optional binary-protocol ingest listen address.
    pub mc_addr: Option<String>,
    /// Root directory for database files.
    pub root: PathBuf,
    /// Maximum time to wait before flushing queued writes.
    pub flush_delay_ms: u64,
    /// Maximum queued ops before a forced commit; also sizes writer inboxes.
    pub max_op_queue: usize,
    /// Idle period after which a writer closes itself.
    pub live_time_ms: u64,
    /// Maximum time a query is allowed to process.
    pub query_timeout_ms: u64,
    /// Number of query tree walkers. 0 means half the CPU parallelism.
    pub query_workers: usize,
    /// Number of document processing workers. 0 means half the CPU parallelism.
    pub doc_workers: usize,
    pub query_backlog: usize,
    pub doc_backlog: usize,
    /// Memcached server backing the query result cache, if any.
    pub cache_addr: Option<String>,
    pub cache_backlog: usize,
    pub cache_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            mc_addr: None,
            root: PathBuf::from("db"),
            flush_delay_ms: DEFAULT_FLUSH_DELAY_MS,
            max_op_queue: DEFAULT_MAX_OP_QUEUE,
            live_time_ms: DEFAULT_LIVE_TIME_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            query_workers: 0,
            doc_workers: 0,
            query_backlog: 0,
            doc_backlog: 0,
            cache_addr: None,
            cache_backlog: DEFAULT_CACHE_BACKLOG,
            cache_workers: DEFAULT_CACHE_WORKERS,
        }
    }
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let contents = fs::read_to_string(&path)?;
            Ok(toml::from_str(&contents)?)
        }
        None => Ok(Config::default()),
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn live_time(&self) -> Duration {
        Duration::from_millis(self.live_time_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn effective_query_workers(&self) -> usize {
        resolve_workers(self.query_workers)
    }

    pub fn effective_doc_workers(&self) -> usize {
        resolve_workers(self.doc_workers)
    }
}

fn resolve_workers(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    let parallelism = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (parallelism / 2).max(1)
}
