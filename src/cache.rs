use std::{collections::HashMap, sync::Arc, time::{Duration, Instant}};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex},
    time::sleep,
};
use tracing::{info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    error::SerieslyError,
    protocol::{opcode, status, Request, Response},
    query::{CacheSet, ProcessIn, ProcessOut},
};

type SharedRx<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Opaques below this are reserved; responses carrying them after a
/// reconnect are expected strays and stay quiet.
const RESERVED_OPAQUES: u32 = 10;
const FIRST_OPAQUE: u32 = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The cache key for a bucket request: a stable 64-bit digest over the
/// bucket's observable inputs, prefixed so identical repeated queries
/// collide and nothing else does.
pub fn cache_key(pi: &ProcessIn) -> String {
    let mut h = Xxh3::new();
    for (key, _) in &pi.docs {
        h.update(key.as_bytes());
    }
    for (ptr, red) in pi.spec.ptrs.iter().zip(pi.spec.reds.iter()) {
        h.update(ptr.as_bytes());
        h.update(red.as_bytes());
    }
    for (f, fv) in pi.spec.filters.iter().zip(pi.spec.filter_vals.iter()) {
        h.update(f.as_bytes());
        h.update(fv.as_bytes());
    }
    format!("{}#{}#{}", pi.spec.dbname, pi.bucket_start, h.digest())
}

pub fn spawn_workers(
    addr: String,
    workers: usize,
    in_rx: SharedRx<ProcessIn>,
    set_rx: SharedRx<CacheSet>,
    doc_tx: mpsc::Sender<ProcessIn>,
) {
    for _ in 0..workers {
        tokio::spawn(cache_worker(
            addr.clone(),
            Arc::clone(&in_rx),
            Arc::clone(&set_rx),
            doc_tx.clone(),
        ));
    }
}

async fn recv_shared<T>(rx: &SharedRx<T>) -> Option<T> {
    let mut guard = rx.lock().await;
    guard.recv().await
}

fn spawn_opener(addr: String, conn_tx: mpsc::Sender<Option<TcpStream>>, delayed: bool) {
    tokio::spawn(async move {
        if delayed {
            sleep(RECONNECT_DELAY).await;
        } else {
            info!("connecting to cache at {addr}");
        }
        let conn = match TcpStream::connect(&addr).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!("failed to connect to cache at {addr}: {err}");
                None
            }
        };
        let _ = conn_tx.send(conn).await;
    });
}

async fn receive_loop(mut read: OwnedReadHalf, resp_tx: mpsc::Sender<Response>) {
    loop {
        match Response::read_from(&mut read).await {
            Ok(Some(res)) => {
                if resp_tx.send(res).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!("error receiving from cache: {err}");
                return;
            }
        }
    }
}

#[derive(Deserialize)]
struct WireResult {
    v: Value,
}

/// One worker: multiplexes many in-flight GETs over a single connection,
/// correlating responses by opaque, and degrades to pass-through whenever
/// the connection is absent. The cache may lose writes freely and never
/// blocks a query.
async fn cache_worker(
    addr: String,
    in_rx: SharedRx<ProcessIn>,
    set_rx: SharedRx<CacheSet>,
    doc_tx: mpsc::Sender<ProcessIn>,
) {
    let (conn_tx, mut conn_rx) = mpsc::channel::<Option<TcpStream>>(1);
    let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(64);
    spawn_opener(addr.clone(), conn_tx.clone(), false);

    let mut writer: Option<OwnedWriteHalf> = None;
    let mut omap: HashMap<u32, ProcessIn> = HashMap::new();
    let mut opaque: u32 = FIRST_OPAQUE;

    loop {
        tokio::select! {
            conn = conn_rx.recv() => {
                match conn {
                    Some(Some(stream)) => {
                        let (read, write) = stream.into_split();
                        writer = Some(write);
                        tokio::spawn(receive_loop(read, resp_tx.clone()));
                    }
                    Some(None) => {
                        spawn_opener(addr.clone(), conn_tx.clone(), true);
                    }
                    None => return,
                }
            }

            pi = recv_shared(&in_rx) => {
                let Some(mut pi) = pi else { return };
                if writer.is_none() {
                    // No connection, pass through.
                    let _ = doc_tx.send(pi).await;
                } else if Instant::now() >= pi.before {
                    // Too old to be worth looking up.
                    let _ = pi.out.send(ProcessOut {
                        cache_key: String::new(),
                        bucket_start: pi.bucket_start,
                        value: Value::Null,
                        err: Some(SerieslyError::Timeout),
                        cache_opaque: 0,
                    }).await;
                } else {
                    let this_opaque = opaque;
                    opaque = if opaque == u32::MAX { FIRST_OPAQUE } else { opaque + 1 };
                    pi.cache_key = cache_key(&pi);
                    let req = Request {
                        opcode: opcode::GET,
                        opaque: this_opaque,
                        key: Bytes::from(pi.cache_key.clone().into_bytes()),
                        ..Request::default()
                    };
                    omap.insert(this_opaque, pi);
                    let failed = match writer.as_mut() {
                        Some(w) => w.write_all(&req.encode()).await.err(),
                        None => None,
                    };
                    if let Some(err) = failed {
                        warn!("error transmitting cache get: {err}");
                        writer = None;
                        drain_in_flight(&mut omap, &doc_tx).await;
                        spawn_opener(addr.clone(), conn_tx.clone(), true);
                    }
                }
            }

            set = recv_shared(&set_rx) => {
                let Some(set) = set else { return };
                if writer.is_some() {
                    let body = serde_json::to_vec(&serde_json::json!({"v": set.value}))
                        .unwrap_or_default();
                    let req = Request {
                        opcode: opcode::SETQ,
                        opaque: 1,
                        extras: Bytes::from_static(&[0u8; 8]),
                        key: Bytes::from(set.key.into_bytes()),
                        body: Bytes::from(body),
                        ..Request::default()
                    };
                    let failed = match writer.as_mut() {
                        Some(w) => w.write_all(&req.encode()).await.err(),
                        None => None,
                    };
                    if let Some(err) = failed {
                        warn!("error transmitting cache set: {err}");
                        writer = None;
                        drain_in_flight(&mut omap, &doc_tx).await;
                        spawn_opener(addr.clone(), conn_tx.clone(), true);
                    }
                }
                // No connection: the set is simply lost.
            }

            res = resp_rx.recv() => {
                let Some(res) = res else { return };
                match omap.remove(&res.opaque) {
                    Some(pi) => {
                        if res.opcode == opcode::GET && res.status == status::SUCCESS {
                            match serde_json::from_slice::<WireResult>(&res.body) {
                                Ok(prior) => {
                                    let po = ProcessOut {
                                        cache_key: pi.cache_key.clone(),
                                        bucket_start: pi.bucket_start,
                                        value: prior.v,
                                        err: None,
                                        cache_opaque: res.opaque,
                                    };
                                    let _ = pi.out.send(po).await;
                                }
                                Err(err) => {
                                    warn!("error decoding cached result: {err}");
                                    let _ = doc_tx.send(pi).await;
                                }
                            }
                        } else {
                            let _ = doc_tx.send(pi).await;
                        }
                    }
                    None => {
                        if res.opaque > RESERVED_OPAQUES {
                            warn!("unknown cache opaque {}", res.opaque);
                        }
                    }
                }
            }
        }
    }
}

async fn drain_in_flight(omap: &mut HashMap<u32, ProcessIn>, doc_tx: &mpsc::Sender<ProcessIn>) {
    for (_, pi) in omap.drain() {
        let _ = doc_tx.send(pi).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        db,
        query::{QueryParams, QueryPipeline, QuerySpec},
        store::BulkWriter,
        time,
    };
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc as tmpsc, oneshot};

    const T0: i64 = 1_346_189_075_000_000_000;

    fn bucket(dbname: &str, ptrs: &[&str], reds: &[&str], start: i64, keys: &[&str]) -> ProcessIn {
        let (out, _rx) = mpsc::channel(1);
        ProcessIn {
            cache_key: String::new(),
            spec: Arc::new(QuerySpec {
                dbname: dbname.to_string(),
                ptrs: ptrs.iter().map(|s| s.to_string()).collect(),
                reds: reds.iter().map(|s| s.to_string()).collect(),
                filters: Vec::new(),
                filter_vals: Vec::new(),
            }),
            bucket_start: start,
            docs: keys
                .iter()
                .map(|k| (k.to_string(), Bytes::new()))
                .collect(),
            peek: None,
            before: Instant::now() + Duration::from_secs(60),
            out,
        }
    }

    #[tokio::test]
    async fn fingerprints_are_deterministic_over_observable_inputs() {
        let a = bucket("db", &["/v"], &["sum"], 1000, &["k1", "k2"]);
        let b = bucket("db", &["/v"], &["sum"], 1000, &["k1", "k2"]);
        assert_eq!(cache_key(&a), cache_key(&b));

        let other_red = bucket("db", &["/v"], &["avg"], 1000, &["k1", "k2"]);
        assert_ne!(cache_key(&a), cache_key(&other_red));

        let other_docs = bucket("db", &["/v"], &["sum"], 1000, &["k1"]);
        assert_ne!(cache_key(&a), cache_key(&other_docs));

        let other_db = bucket("db2", &["/v"], &["sum"], 1000, &["k1", "k2"]);
        assert_ne!(cache_key(&a), cache_key(&other_db));

        assert!(cache_key(&a).starts_with("db#1000#"));
    }

    enum FakeMode {
        Miss,
        Hit(Value),
    }

    /// A minimal binary-protocol cache: answers every GET per the mode and
    /// records SETQs.
    async fn fake_cache(
        listener: TcpListener,
        mode: FakeMode,
        connected: oneshot::Sender<()>,
        sets: tmpsc::UnboundedSender<(String, Value)>,
    ) {
        let (sock, _) = listener.accept().await.expect("accept");
        let _ = connected.send(());
        let (mut read, mut write) = sock.into_split();
        while let Ok(Some(req)) = Request::read_from(&mut read).await {
            match req.opcode {
                opcode::GET => {
                    let res = match &mode {
                        FakeMode::Miss => Response {
                            opcode: opcode::GET,
                            status: status::KEY_ENOENT,
                            opaque: req.opaque,
                            ..Response::default()
                        },
                        FakeMode::Hit(v) => Response {
                            opcode: opcode::GET,
                            status: status::SUCCESS,
                            opaque: req.opaque,
                            body: Bytes::from(
                                serde_json::to_vec(&json!({"v": v})).unwrap(),
                            ),
                            ..Response::default()
                        },
                    };
                    if write.write_all(&res.encode()).await.is_err() {
                        return;
                    }
                }
                opcode::SETQ => {
                    let key = String::from_utf8_lossy(&req.key).to_string();
                    let value: Value = serde_json::from_slice::<WireResult>(&req.body)
                        .map(|w| w.v)
                        .unwrap_or(Value::Null);
                    let _ = sets.send((key, value));
                }
                _ => {}
            }
        }
    }

    async fn pipeline_with_cache(dir: &TempDir, mode: FakeMode) -> (QueryPipeline, tmpsc::UnboundedReceiver<(String, Value)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (connected_tx, connected_rx) = oneshot::channel();
        let (sets_tx, sets_rx) = tmpsc::unbounded_channel();
        tokio::spawn(fake_cache(listener, mode, connected_tx, sets_tx));

        let config = Arc::new(Config {
            root: dir.path().to_path_buf(),
            cache_addr: Some(addr),
            cache_workers: 1,
            query_workers: 1,
            doc_workers: 1,
            ..Config::default()
        });
        let pipeline = QueryPipeline::start(config);
        connected_rx.await.expect("cache connection");
        // Give the worker a beat to pick the connection out of its inbox.
        sleep(Duration::from_millis(50)).await;
        (pipeline, sets_rx)
    }

    fn seed(dir: &TempDir, name: &str) {
        db::create(dir.path(), name).unwrap();
        let handle = db::open(dir.path(), name, "test").unwrap();
        let mut bulk = BulkWriter::new(Arc::clone(&handle.store));
        bulk.set(time::format_key(T0), br#"{"v":1}"#.to_vec());
        bulk.set(time::format_key(T0 + 1_000_000), br#"{"v":2}"#.to_vec());
        bulk.commit().unwrap();
    }

    fn sum_params(name: &str) -> QueryParams {
        QueryParams {
            dbname: name.to_string(),
            from: String::new(),
            to: String::new(),
            group_ms: 1_000,
            ptrs: vec!["/v".to_string()],
            reds: vec!["sum".to_string()],
            filters: Vec::new(),
            filter_vals: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_miss_passes_through_and_writes_back() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "misses");
        let (pipeline, mut sets) = pipeline_with_cache(&dir, FakeMode::Miss).await;

        let results = pipeline
            .execute(sum_params("misses"))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(results[&T0].value, json!([3]));

        // The fresh result goes back to the cache, fire and forget.
        let (key, value) = sets.recv().await.expect("a SETQ should arrive");
        assert!(key.starts_with("misses#"));
        assert_eq!(value, json!([3]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_hit_skips_the_document_workers() {
        let dir = TempDir::new().unwrap();
        seed(&dir, "hits");
        let (pipeline, _sets) =
            pipeline_with_cache(&dir, FakeMode::Hit(json!([42]))).await;

        let results = pipeline
            .execute(sum_params("hits"))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        // The cached value wins over what the documents would reduce to.
        assert_eq!(results[&T0].value, json!([42]));
        assert!(results[&T0].cache_opaque >= FIRST_OPAQUE);
    }
}
