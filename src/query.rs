use std::{
    collections::BTreeMap,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use crate::{
    cache,
    config::Config,
    db,
    error::{Result, SerieslyError},
    pointer,
    reducers::{self, PtrVal, Reduce},
    time,
};

type SharedRx<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// The immutable shape of one query, shared by every bucket it produces.
#[derive(Debug)]
pub struct QuerySpec {
    pub dbname: String,
    pub ptrs: Vec<String>,
    pub reds: Vec<String>,
    pub filters: Vec<String>,
    pub filter_vals: Vec<String>,
}

/// One bucket's worth of work headed for the cache or document stage.
pub struct ProcessIn {
    pub cache_key: String,
    pub spec: Arc<QuerySpec>,
    pub bucket_start: i64,
    pub docs: Vec<(String, Bytes)>,
    pub peek: Option<(String, Bytes)>,
    pub before: Instant,
    pub out: mpsc::Sender<ProcessOut>,
}

/// One bucket result. On the wire a result is `{"v": values}`.
pub struct ProcessOut {
    pub cache_key: String,
    pub bucket_start: i64,
    pub value: Value,
    pub err: Option<SerieslyError>,
    pub cache_opaque: u32,
}

impl ProcessOut {
    pub fn wire_value(&self) -> Value {
        json!({ "v": self.value })
    }
}

/// A fresh result on its way to the external cache, best effort.
pub struct CacheSet {
    pub key: String,
    pub value: Value,
}

pub struct QueryParams {
    pub dbname: String,
    pub from: String,
    pub to: String,
    pub group_ms: i64,
    pub ptrs: Vec<String>,
    pub reds: Vec<String>,
    pub filters: Vec<String>,
    pub filter_vals: Vec<String>,
}

struct QueryIn {
    spec: Arc<QuerySpec>,
    from: String,
    to: String,
    chunk: i64,
    before: Instant,
    started: Arc<AtomicI64>,
    total_keys: Arc<AtomicI64>,
    out: mpsc::Sender<ProcessOut>,
    walk_err: oneshot::Sender<Result<()>>,
}

/// Caller's view of a running query: bucket results, the walk's terminal
/// signal, and the progress counters observers read.
pub struct QueryHandle {
    pub out: mpsc::Receiver<ProcessOut>,
    pub walk_err: oneshot::Receiver<Result<()>>,
    pub started: Arc<AtomicI64>,
    pub total_keys: Arc<AtomicI64>,
    pub start: Instant,
    pub before: Instant,
}

impl QueryHandle {
    /// Drains to completion, collecting results keyed by bucket start.
    /// Completion requires the terminal walk signal AND started ==
    /// finished; either alone is not enough.
    pub async fn collect(mut self) -> Result<BTreeMap<i64, ProcessOut>> {
        let mut results = BTreeMap::new();
        let mut finished: i64 = 0;
        let mut walk_done = false;
        let mut terminal: Result<()> = Ok(());

        loop {
            if walk_done && self.started.load(Ordering::Relaxed) == finished {
                break;
            }
            tokio::select! {
                maybe = self.out.recv() => {
                    let Some(po) = maybe else { break };
                    finished += 1;
                    results.insert(po.bucket_start, po);
                }
                res = &mut self.walk_err, if !walk_done => {
                    walk_done = true;
                    terminal = res.unwrap_or(Err(SerieslyError::Internal(
                        "query walker dropped".to_string(),
                    )));
                }
            }
        }

        terminal.map(|_| results)
    }
}

/// Slices an ascending key scan into time-aligned groups without buffering
/// the whole range. Keys that do not parse as canonical timestamps are
/// skipped.
pub struct BucketSlicer {
    chunk: i64,
    docs: Vec<(String, Bytes)>,
    bucket_start: i64,
    next_boundary: String,
}

pub struct Bucket {
    pub bucket_start: i64,
    pub docs: Vec<(String, Bytes)>,
}

impl BucketSlicer {
    pub fn new(chunk: i64) -> Self {
        Self {
            chunk,
            docs: Vec::new(),
            bucket_start: 0,
            next_boundary: String::new(),
        }
    }

    /// Feeds the next document in scan order. Returns the completed bucket
    /// when `key` falls past the current group boundary; the fed document
    /// is then the completed bucket's peek sample.
    pub fn push(&mut self, key: &str, value: Bytes) -> Option<Bucket> {
        let kns = time::parse_key(key);
        if kns < 0 {
            return None;
        }

        let mut completed = None;
        if !self.docs.is_empty() && key >= self.next_boundary.as_str() {
            completed = Some(Bucket {
                bucket_start: self.bucket_start,
                docs: std::mem::take(&mut self.docs),
            });
        }
        if self.docs.is_empty() {
            self.bucket_start = (kns / self.chunk) * self.chunk;
            self.next_boundary = time::format_key(self.bucket_start + self.chunk);
        }
        self.docs.push((key.to_string(), value));
        completed
    }

    pub fn finish(mut self) -> Option<Bucket> {
        if self.docs.is_empty() {
            return None;
        }
        Some(Bucket {
            bucket_start: self.bucket_start,
            docs: std::mem::take(&mut self.docs),
        })
    }
}

/// The three pool stages and the channels between them.
#[derive(Clone)]
pub struct QueryPipeline {
    config: Arc<Config>,
    query_tx: mpsc::Sender<QueryIn>,
}

impl QueryPipeline {
    pub fn start(config: Arc<Config>) -> QueryPipeline {
        let (doc_tx, doc_rx) = mpsc::channel::<ProcessIn>(config.doc_backlog.max(1));
        let doc_rx: SharedRx<ProcessIn> = Arc::new(Mutex::new(doc_rx));

        // With a cache configured, buckets enter through it; otherwise they
        // go straight to the document workers.
        let (bucket_tx, set_tx) = match &config.cache_addr {
            Some(addr) => {
                let (cache_tx, cache_rx) = mpsc::channel(config.cache_backlog.max(1));
                let (set_tx, set_rx) = mpsc::channel(config.cache_backlog.max(1));
                cache::spawn_workers(
                    addr.clone(),
                    config.cache_workers.max(1),
                    Arc::new(Mutex::new(cache_rx)),
                    Arc::new(Mutex::new(set_rx)),
                    doc_tx.clone(),
                );
                (cache_tx, Some(set_tx))
            }
            None => (doc_tx.clone(), None),
        };

        for _ in 0..config.effective_doc_workers() {
            tokio::spawn(doc_worker(Arc::clone(&doc_rx), set_tx.clone()));
        }

        let (query_tx, query_rx) = mpsc::channel::<QueryIn>(config.query_backlog.max(1));
        let query_rx: SharedRx<QueryIn> = Arc::new(Mutex::new(query_rx));
        for _ in 0..config.effective_query_workers() {
            tokio::spawn(query_executor(
                Arc::clone(&query_rx),
                bucket_tx.clone(),
                Arc::clone(&config),
            ));
        }

        QueryPipeline { config, query_tx }
    }

    /// Validates and submits a query, returning the handle its results
    /// arrive on.
    pub async fn execute(&self, params: QueryParams) -> Result<QueryHandle> {
        if params.ptrs.is_empty() {
            return Err(SerieslyError::BadRequest(
                "at least one pointer is required".to_string(),
            ));
        }
        if params.ptrs.len() != params.reds.len() {
            return Err(SerieslyError::BadRequest(
                "must supply the same number of pointers and reducers".to_string(),
            ));
        }
        if params.filters.len() != params.filter_vals.len() {
            return Err(SerieslyError::BadRequest(
                "must supply the same number of filters and filter values".to_string(),
            ));
        }
        for name in &params.reds {
            if !reducers::is_valid(name) {
                return Err(SerieslyError::BadReducer(name.clone()));
            }
        }
        if params.group_ms <= 0 {
            return Err(SerieslyError::BadRange(
                "group must be a positive number of milliseconds".to_string(),
            ));
        }

        let start = Instant::now();
        let before = start + self.config.query_timeout();
        let started = Arc::new(AtomicI64::new(0));
        let total_keys = Arc::new(AtomicI64::new(0));
        let (out_tx, out_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = oneshot::channel();

        let qi = QueryIn {
            spec: Arc::new(QuerySpec {
                dbname: params.dbname,
                ptrs: params.ptrs,
                reds: params.reds,
                filters: params.filters,
                filter_vals: params.filter_vals,
            }),
            from: params.from,
            to: params.to,
            chunk: params.group_ms * 1_000_000,
            before,
            started: Arc::clone(&started),
            total_keys: Arc::clone(&total_keys),
            out: out_tx,
            walk_err: err_tx,
        };

        self.query_tx
            .send(qi)
            .await
            .map_err(|_| SerieslyError::Internal("query pool is down".to_string()))?;

        Ok(QueryHandle {
            out: out_rx,
            walk_err: err_rx,
            started,
            total_keys,
            start,
            before,
        })
    }
}

async fn query_executor(
    rx: SharedRx<QueryIn>,
    bucket_tx: mpsc::Sender<ProcessIn>,
    config: Arc<Config>,
) {
    loop {
        let qi = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(qi) = qi else { return };

        if Instant::now() >= qi.before {
            warn!("timed out query before it started");
            let _ = qi.walk_err.send(Err(SerieslyError::Timeout));
            continue;
        }
        run_query(qi, bucket_tx.clone(), &config).await;
    }
}

async fn run_query(qi: QueryIn, bucket_tx: mpsc::Sender<ProcessIn>, config: &Arc<Config>) {
    let QueryIn {
        spec,
        from,
        to,
        chunk,
        before,
        started,
        total_keys,
        out,
        walk_err,
    } = qi;

    let root = config.root.clone();
    let walk = tokio::task::spawn_blocking(move || {
        // Scans get their own fresh handle; they never contend with the
        // database's writer.
        let handle = db::open(&root, &spec.dbname, "query")?;
        let store = Arc::clone(&handle.store);
        let mut slicer = BucketSlicer::new(chunk);
        let dispatch = |bucket: Bucket, peek: Option<(String, Bytes)>| -> Result<()> {
            started.fetch_add(1, Ordering::Relaxed);
            let pi = ProcessIn {
                cache_key: String::new(),
                spec: Arc::clone(&spec),
                bucket_start: bucket.bucket_start,
                docs: bucket.docs,
                peek,
                before,
                out: out.clone(),
            };
            bucket_tx
                .blocking_send(pi)
                .map_err(|_| SerieslyError::Internal("bucket stage is down".to_string()))
        };

        let result = store.walk_range(&from, &to, |k, v| {
            total_keys.fetch_add(1, Ordering::Relaxed);
            let v = Bytes::from(v);
            if let Some(bucket) = slicer.push(k, v.clone()) {
                dispatch(bucket, Some((k.to_string(), v)))?;
            }
            Ok(ControlFlow::Continue(()))
        });

        if result.is_ok() {
            if let Some(bucket) = slicer.finish() {
                dispatch(bucket, None)?;
            }
        }
        result
    });

    let result = match walk.await {
        Ok(result) => result,
        Err(err) => Err(SerieslyError::Internal(format!("walker panicked: {err}"))),
    };
    let _ = walk_err.send(result);
}

async fn doc_worker(rx: SharedRx<ProcessIn>, set_tx: Option<mpsc::Sender<CacheSet>>) {
    loop {
        let pi = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(pi) = pi else { return };

        let po = if Instant::now() >= pi.before {
            ProcessOut {
                cache_key: String::new(),
                bucket_start: pi.bucket_start,
                value: Value::Null,
                err: Some(SerieslyError::Timeout),
                cache_opaque: 0,
            }
        } else {
            process_bucket(&pi)
        };

        // It's fine if the fresh result can't make it into the cache, but
        // it must never hold up the reply.
        if po.err.is_none() && !po.cache_key.is_empty() && po.cache_opaque == 0 {
            if let Some(set_tx) = &set_tx {
                let _ = set_tx.try_send(CacheSet {
                    key: po.cache_key.clone(),
                    value: po.value.clone(),
                });
            }
        }

        let _ = pi.out.send(po).await;
    }
}

fn process_bucket(pi: &ProcessIn) -> ProcessOut {
    let spec = &pi.spec;
    let mut reds: Vec<Box<dyn Reduce>> = spec
        .reds
        .iter()
        .map(|name| reducers::build(name).expect("reducer names validated at query entry"))
        .collect();
    let distinct = pointer::distinct_pointers(&spec.filters, &spec.ptrs);

    for (key, body) in &pi.docs {
        feed_document(spec, &distinct, key, body, true, &mut reds);
    }
    if let Some((key, body)) = &pi.peek {
        feed_document(spec, &distinct, key, body, false, &mut reds);
    }

    let values: Vec<Value> = reds.into_iter().map(|r| r.finish()).collect();
    ProcessOut {
        cache_key: pi.cache_key.clone(),
        bucket_start: pi.bucket_start,
        value: Value::Array(values),
        err: None,
        cache_opaque: 0,
    }
}

fn feed_document(
    spec: &QuerySpec,
    distinct: &[String],
    key: &str,
    body: &Bytes,
    included: bool,
    reds: &mut [Box<dyn Reduce>],
) {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let extracted: Vec<Option<Value>> = distinct
        .iter()
        .map(|p| {
            parsed
                .as_ref()
                .and_then(|doc| pointer::extract(doc, key, p))
        })
        .collect();
    let value_of = |ptr: &str| -> Option<&Value> {
        distinct
            .iter()
            .position(|p| p == ptr)
            .and_then(|i| extracted[i].as_ref())
    };

    let passes = spec
        .filters
        .iter()
        .zip(spec.filter_vals.iter())
        .all(|(f, fv)| pointer::filter_matches(value_of(f), fv));

    if !passes && included {
        return;
    }

    for (i, ptr) in spec.ptrs.iter().enumerate() {
        // A peek document that fails the filters still yields its
        // structural sample, just with no value.
        let val = if passes { value_of(ptr).cloned() } else { None };
        reds[i].feed(&PtrVal {
            key: Some(key.to_string()),
            val,
            included,
        });
    }
}
