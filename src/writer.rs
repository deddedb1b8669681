use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{interval_at, sleep, Instant},
};
use tracing::{error, info};

use crate::{
    config::Config,
    db,
    debug,
    error::{Result, SerieslyError},
    store::{BulkWriter, Store},
};

pub enum WriteOp {
    Store { key: String, body: Vec<u8> },
    Delete { key: String },
    Compact { reply: oneshot::Sender<Result<()>> },
}

/// Handle to a database's single writer task. Cheap to clone; all clones
/// feed the same inbox.
#[derive(Clone)]
pub struct Writer {
    name: String,
    tx: mpsc::Sender<WriteOp>,
    quit_tx: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
}

impl Writer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a store op. Blocks once the inbox is full, which is the
    /// backpressure ingest relies on.
    pub async fn store(&self, key: String, body: Vec<u8>) -> Result<()> {
        self.tx
            .send(WriteOp::Store { key, body })
            .await
            .map_err(|_| SerieslyError::Closed)
    }

    pub async fn delete(&self, key: String) -> Result<()> {
        self.tx
            .send(WriteOp::Delete { key })
            .await
            .map_err(|_| SerieslyError::Closed)
    }

    /// Requests a compaction and waits for its outcome.
    pub async fn compact(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Compact { reply })
            .await
            .map_err(|_| SerieslyError::Closed)?;
        rx.await.map_err(|_| SerieslyError::Closed)?
    }

    /// Signals the task to commit and shut down. The first call wins;
    /// subsequent calls report the writer as already closed.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SerieslyError::Closed);
        }
        let _ = self.quit_tx.send(true);
        Ok(())
    }
}

/// Process-wide map from database name to its live writer task.
pub struct WriterRegistry {
    config: Arc<Config>,
    inner: Mutex<HashMap<String, Writer>>,
}

impl WriterRegistry {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the live writer for `name`, creating one on miss. The bool
    /// reports whether this call opened it, so one-shot callers (compact)
    /// can close what they opened.
    pub fn get_or_create(self: &Arc<Self>, name: &str) -> Result<(Writer, bool)> {
        let mut map = self.inner.lock();
        if let Some(writer) = map.get(name) {
            return Ok((writer.clone(), false));
        }
        let writer = spawn_writer(name, Arc::clone(self))?;
        map.insert(name.to_string(), writer.clone());
        Ok((writer, true))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().contains_key(name)
    }

    /// Clears the entry and signals its task to shut down. Used by writers
    /// on their own way out and by explicit database deletion.
    pub fn remove(&self, name: &str) {
        let writer = self.inner.lock().remove(name);
        if let Some(writer) = writer {
            let _ = writer.close();
        }
    }

    pub fn close_all(&self) {
        let writers: Vec<Writer> = self.inner.lock().drain().map(|(_, w)| w).collect();
        for writer in writers {
            let _ = writer.close();
        }
    }
}

fn spawn_writer(name: &str, registry: Arc<WriterRegistry>) -> Result<Writer> {
    let config = Arc::clone(&registry.config);
    let path = db::db_path(&config.root, name);
    let store = Arc::new(Store::open(&path, false)?);

    let (tx, rx) = mpsc::channel(config.max_op_queue.max(1));
    let (quit_tx, quit_rx) = watch::channel(false);
    let writer = Writer {
        name: name.to_string(),
        tx,
        quit_tx,
        closed: Arc::new(AtomicBool::new(false)),
    };

    let task = WriterTask {
        name: name.to_string(),
        path,
        store,
        registry,
        config,
        closed: Arc::clone(&writer.closed),
    };
    tokio::spawn(task.run(rx, quit_rx));

    Ok(writer)
}

struct WriterTask {
    name: String,
    path: PathBuf,
    store: Arc<Store>,
    registry: Arc<WriterRegistry>,
    config: Arc<Config>,
    closed: Arc<AtomicBool>,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<WriteOp>, mut quit_rx: watch::Receiver<bool>) {
        let stats = debug::db_stat(&self.name);
        let mut debug_id =
            debug::record_open(&self.path.to_string_lossy(), "writer");
        stats.note_open();

        let mut bulk = BulkWriter::new(Arc::clone(&self.store));
        let mut queued = 0usize;
        let mut live_ops = 0usize;

        let flush_delay = self.config.flush_delay();
        let flush = sleep(flush_delay);
        tokio::pin!(flush);
        let live_time = self.config.live_time();
        let mut live = interval_at(Instant::now() + live_time, live_time);

        loop {
            tokio::select! {
                _ = quit_rx.changed() => {
                    // Ops already accepted into the inbox still land in the
                    // final commit.
                    while let Ok(op) = rx.try_recv() {
                        match op {
                            WriteOp::Store { key, body } => bulk.set(key, body),
                            WriteOp::Delete { key } => bulk.delete(key),
                            WriteOp::Compact { reply } => {
                                let _ = reply.send(Err(SerieslyError::Closed));
                            }
                        }
                    }
                    self.commit(&mut bulk);
                    break;
                }
                _ = live.tick() => {
                    if queued == 0 && live_ops == 0 && rx.is_empty() {
                        info!("closing idle database {}", self.name);
                        self.closed.store(true, Ordering::SeqCst);
                        break;
                    }
                    live_ops = 0;
                }
                item = rx.recv() => {
                    let Some(op) = item else {
                        self.commit(&mut bulk);
                        break;
                    };
                    match op {
                        WriteOp::Store { key, body } => {
                            bulk.set(key, body);
                            queued += 1;
                            live_ops += 1;
                            stats.note_written(1);
                        }
                        WriteOp::Delete { key } => {
                            bulk.delete(key);
                            queued += 1;
                            live_ops += 1;
                        }
                        WriteOp::Compact { reply } => {
                            live_ops += 1;
                            let result = self.compact(&mut bulk, &mut debug_id);
                            queued = 0;
                            flush.as_mut().reset(Instant::now() + flush_delay);
                            let _ = reply.send(result);
                        }
                    }
                    stats.set_qlen(queued as u32);
                    if queued >= self.config.max_op_queue {
                        self.commit(&mut bulk);
                        queued = 0;
                        stats.set_qlen(0);
                        flush.as_mut().reset(Instant::now() + flush_delay);
                    }
                }
                _ = &mut flush => {
                    if queued > 0 {
                        self.commit(&mut bulk);
                        queued = 0;
                        stats.set_qlen(0);
                    }
                    flush.as_mut().reset(Instant::now() + flush_delay);
                }
            }
        }

        drop(bulk);
        debug::record_close(debug_id);
        stats.note_close();
        self.registry.remove(&self.name);
        info!("closed {}", self.name);
    }

    /// Commit errors are logged and the batch is dropped; ingest is
    /// best-effort within the flush window.
    fn commit(&self, bulk: &mut BulkWriter) {
        if bulk.queued() == 0 {
            return;
        }
        let start = std::time::Instant::now();
        match bulk.commit() {
            Ok(n) => {
                tracing::debug!(
                    "flushed {n} items on {} in {:?}",
                    self.name,
                    start.elapsed()
                );
            }
            Err(err) => error!("error committing {}: {err}", self.name),
        }
    }

    /// Commits, rewrites the live file through a `.compact` sibling, and
    /// resumes on a fresh handle.
    fn compact(&mut self, bulk: &mut BulkWriter, debug_id: &mut u64) -> Result<()> {
        bulk.commit()
            .map_err(|err| SerieslyError::CompactFailed(err.to_string()))?;

        let compact_path = PathBuf::from(format!("{}.compact", self.path.display()));
        self.store.compact_to(&compact_path)?;
        fs::rename(&compact_path, &self.path)
            .map_err(|err| SerieslyError::CompactFailed(format!("rename: {err}")))?;

        let reopened = Arc::new(Store::open(&self.path, false).map_err(|err| {
            error!("error reopening {} after compact: {err}", self.name);
            SerieslyError::CompactFailed(err.to_string())
        })?);

        debug::record_close(*debug_id);
        *debug_id = debug::record_open(&self.path.to_string_lossy(), "writer");
        self.store = reopened;
        *bulk = BulkWriter::new(Arc::clone(&self.store));
        Ok(())
    }
}
