use std::{
    collections::HashMap,
    convert::Infallible,
    ops::ControlFlow,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::de::IgnoredAny;
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    config::Config,
    db, debug,
    error::{Result, SerieslyError},
    mcserver,
    query::{QueryHandle, QueryParams, QueryPipeline},
    time,
    writer::WriterRegistry,
    VERSION,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub writers: Arc<WriterRegistry>,
    pub pipeline: QueryPipeline,
}

pub fn build_state(config: Arc<Config>) -> AppState {
    let writers = WriterRegistry::new(Arc::clone(&config));
    let pipeline = QueryPipeline::start(Arc::clone(&config));
    AppState {
        config,
        writers,
        pipeline,
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(server_info))
        .route("/_all_dbs", get(list_databases))
        .route("/_debug/open", get(debug_open))
        .route("/_debug/vars", get(debug_vars))
        .route(
            "/{db}",
            get(db_info)
                .put(create_db)
                .delete(delete_db)
                .post(new_document),
        )
        .route("/{db}/_compact", post(compact_db))
        .route("/{db}/_bulk", delete(delete_bulk))
        .route("/{db}/_all", get(all_docs))
        .route("/{db}/_dump", get(dump_docs))
        .route("/{db}/_query", get(query_db))
        .route(
            "/{db}/{key}",
            get(get_document).put(put_document).delete(rm_document),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

pub async fn run(config: Config) -> Result<()> {
    config.ensure_root()?;
    let config = Arc::new(config);
    let state = build_state(Arc::clone(&config));

    if let Some(mc_addr) = config.mc_addr.clone() {
        let registry = Arc::clone(&state.writers);
        tokio::spawn(async move {
            if let Err(err) = mcserver::listen(&mc_addr, registry).await {
                warn!("ingest listener failed: {err}");
            }
        });
    }

    let writers = Arc::clone(&state.writers);
    let app = build_router(state);
    let listener = TcpListener::bind(&config.addr).await?;
    info!("listening for web requests on {}", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    writers.close_all();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Logs (but never aborts) when a handler outlives its expected deadline.
struct Watchdog {
    task: tokio::task::JoinHandle<()>,
}

impl Watchdog {
    fn arm(label: String, deadline: Duration) -> Watchdog {
        let armed_at = Instant::now();
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(
                "{label} is taking longer than {:?} (started {:?} ago)",
                deadline,
                armed_at.elapsed()
            );
        });
        Watchdog { task }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn cleanup_range_param(input: Option<&String>) -> Result<String> {
    match input.map(String::as_str).unwrap_or_default() {
        "" => Ok(String::new()),
        raw => Ok(time::format_canonical(time::parse_time(raw)?)),
    }
}

fn json_stream_response(rx: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn server_info() -> impl IntoResponse {
    Json(json!({"seriesly": "Why so series?", "version": VERSION}))
}

async fn list_databases(State(state): State<AppState>) -> impl IntoResponse {
    Json(db::db_list(&state.config.root))
}

async fn debug_open() -> impl IntoResponse {
    Json(debug::open_handles_snapshot())
}

async fn debug_vars() -> impl IntoResponse {
    Json(debug::vars_snapshot())
}

async fn create_db(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
) -> Result<StatusCode> {
    if !db::is_valid_dbname(&dbname) {
        return Err(SerieslyError::BadRequest(format!(
            "illegal database name: {dbname}"
        )));
    }
    db::create(&state.config.root, &dbname)?;
    Ok(StatusCode::CREATED)
}

async fn delete_db(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.writers.remove(&dbname);
    db::delete(&state.config.root, &dbname)?;
    Ok(Json(json!({"ok": true})))
}

/// Also answers HEAD with the same status and no body.
async fn db_info(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
) -> Result<Json<crate::store::DbInfo>> {
    let handle =
        db::open(&state.config.root, &dbname, "db_info").map_err(|_| SerieslyError::NotFound)?;
    Ok(Json(handle.store.info()))
}

async fn new_document(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<StatusCode> {
    let key = match params.get("ts").map(String::as_str).unwrap_or_default() {
        "" => time::now_key(),
        raw => time::format_canonical(time::parse_time(raw)?),
    };
    ingest(&state, dbname, key, body).await
}

async fn put_document(
    State(state): State<AppState>,
    Path((dbname, key)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode> {
    ingest(&state, dbname, key, body).await
}

async fn ingest(state: &AppState, dbname: String, key: String, body: Bytes) -> Result<StatusCode> {
    if serde_json::from_slice::<IgnoredAny>(&body).is_err() {
        return Err(SerieslyError::BadRequest(
            "document body must be well-formed JSON".to_string(),
        ));
    }
    let (writer, _) = state.writers.get_or_create(&dbname)?;
    writer.store(key, body.to_vec()).await?;
    Ok(StatusCode::CREATED)
}

async fn get_document(
    State(state): State<AppState>,
    Path((dbname, key)): Path<(String, String)>,
) -> Result<Response> {
    let handle = db::open(&state.config.root, &dbname, "get_document")
        .map_err(|_| SerieslyError::NotFound)?;
    match handle.store.get(&key)? {
        Some(body) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()),
        None => Err(SerieslyError::NotFound),
    }
}

async fn rm_document() -> Result<StatusCode> {
    Err(SerieslyError::NotImplemented)
}

async fn compact_db(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let _wd = Watchdog::arm(format!("POST /{dbname}/_compact"), Duration::from_secs(30));
    let (writer, opened) = state.writers.get_or_create(&dbname)?;
    let result = writer.compact().await;
    if opened {
        // Don't leave a writer lingering for a database nobody is writing.
        let _ = writer.close();
    }
    result?;
    Ok(Json(json!({"ok": true})))
}

async fn delete_bulk(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>> {
    let _wd = Watchdog::arm(
        format!("DELETE /{dbname}/_bulk"),
        state.config.query_timeout(),
    );
    let from = cleanup_range_param(params.get("from"))?;
    let to = cleanup_range_param(params.get("to"))?;
    let want_compact = params.get("compact").map(String::as_str) == Some("true");

    let handle = db::open(&state.config.root, &dbname, "delete_bulk")?;
    let keys = tokio::task::spawn_blocking(move || {
        let mut keys = Vec::new();
        let result = handle.store.walk_range(&from, &to, |k, _| {
            keys.push(k.to_string());
            Ok(ControlFlow::Continue(()))
        });
        result.map(|_| keys)
    })
    .await
    .map_err(|err| SerieslyError::Internal(err.to_string()))??;

    let (writer, opened) = state.writers.get_or_create(&dbname)?;
    let deleted = keys.len();
    for key in keys {
        writer.delete(key).await?;
    }
    if want_compact {
        writer.compact().await?;
    }
    if opened {
        let _ = writer.close();
    }
    Ok(Json(json!({"deleted": deleted})))
}

fn parse_limit(params: &HashMap<String, String>) -> Result<usize> {
    match params.get("limit").map(String::as_str).unwrap_or_default() {
        "" => Ok(usize::MAX),
        raw => raw
            .parse()
            .map_err(|_| SerieslyError::BadRequest(format!("bad limit value: {raw}"))),
    }
}

async fn all_docs(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    stream_docs(state, dbname, params, DocFraming::Object).await
}

async fn dump_docs(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    stream_docs(state, dbname, params, DocFraming::Lines).await
}

enum DocFraming {
    /// One JSON object: `{"k1": v1, "k2": v2}`.
    Object,
    /// Newline-delimited single-pair objects: `{"k": v}\n`.
    Lines,
}

async fn stream_docs(
    state: AppState,
    dbname: String,
    params: HashMap<String, String>,
    framing: DocFraming,
) -> Result<Response> {
    let from = cleanup_range_param(params.get("from"))?;
    let to = cleanup_range_param(params.get("to"))?;
    let limit = parse_limit(&params)?;
    let handle =
        db::open(&state.config.root, &dbname, "all_docs").map_err(|_| SerieslyError::NotFound)?;
    let wd = Watchdog::arm(
        format!("GET /{dbname}/_all"),
        state.config.query_timeout(),
    );

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::task::spawn_blocking(move || {
        let _wd = wd;
        if matches!(framing, DocFraming::Object) {
            let _ = tx.blocking_send(Bytes::from_static(b"{"));
        }
        let mut sent = 0usize;
        let result = handle.store.walk_range(&from, &to, |k, v| {
            if sent >= limit {
                return Ok(ControlFlow::Break(()));
            }
            let quoted = serde_json::to_string(k)?;
            let mut chunk = Vec::with_capacity(quoted.len() + v.len() + 8);
            match framing {
                DocFraming::Object => {
                    if sent > 0 {
                        chunk.extend_from_slice(b",\n");
                    }
                    chunk.extend_from_slice(quoted.as_bytes());
                    chunk.extend_from_slice(b": ");
                    chunk.extend_from_slice(&v);
                }
                DocFraming::Lines => {
                    chunk.extend_from_slice(b"{");
                    chunk.extend_from_slice(quoted.as_bytes());
                    chunk.extend_from_slice(b": ");
                    chunk.extend_from_slice(&v);
                    chunk.extend_from_slice(b"}\n");
                }
            }
            sent += 1;
            if tx.blocking_send(Bytes::from(chunk)).is_err() {
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        });
        if let Err(err) = result {
            warn!("error walking {dbname}: {err}");
        }
        if matches!(framing, DocFraming::Object) {
            let _ = tx.blocking_send(Bytes::from_static(b"}"));
        }
    });

    Ok(json_stream_response(rx))
}

async fn query_db(
    State(state): State<AppState>,
    Path(dbname): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Response> {
    let mut group: Option<String> = None;
    let mut from = String::new();
    let mut to = String::new();
    let mut ptrs = Vec::new();
    let mut reds = Vec::new();
    let mut filters = Vec::new();
    let mut filter_vals = Vec::new();

    for (name, value) in pairs {
        match name.as_str() {
            "group" => group = Some(value),
            "from" => from = value,
            "to" => to = value,
            "ptr" => ptrs.push(value),
            "reducer" => reds.push(value),
            "f" => filters.push(value),
            "fv" => filter_vals.push(value),
            _ => {}
        }
    }

    let group_ms: i64 = group
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| SerieslyError::BadRequest("bad group value".to_string()))?;
    let from = cleanup_range_param(Some(&from))?;
    let to = cleanup_range_param(Some(&to))?;

    let handle = state
        .pipeline
        .execute(QueryParams {
            dbname: dbname.clone(),
            from,
            to,
            group_ms,
            ptrs,
            reds,
            filters,
            filter_vals,
        })
        .await?;

    let wd = Watchdog::arm(
        format!("GET /{dbname}/_query"),
        state.config.query_timeout(),
    );
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(drain_query(handle, tx, dbname, wd));
    Ok(json_stream_response(rx))
}

/// Streams bucket results in arrival order; done only when the walk has
/// finished AND every started bucket has replied.
async fn drain_query(handle: QueryHandle, tx: mpsc::Sender<Bytes>, dbname: String, wd: Watchdog) {
    let QueryHandle {
        mut out,
        mut walk_err,
        started,
        total_keys,
        start,
        before: _,
    } = handle;

    let _ = tx.send(Bytes::from_static(b"{")).await;
    let mut emitted = false;
    let mut client_gone = false;
    let mut finished: i64 = 0;
    let mut walk_done = false;
    let mut terminal: Result<()> = Ok(());

    loop {
        if walk_done && started.load(Ordering::Relaxed) == finished {
            break;
        }
        tokio::select! {
            maybe = out.recv() => {
                let Some(po) = maybe else { break };
                finished += 1;
                if let Some(err) = &po.err {
                    warn!("bucket at {} failed on {dbname}: {err}", po.bucket_start);
                    continue;
                }
                if client_gone {
                    continue;
                }
                let mut chunk = Vec::new();
                if emitted {
                    chunk.extend_from_slice(b",\n");
                }
                chunk.extend_from_slice(format!("\"{}\": ", po.bucket_start / 1_000_000).as_bytes());
                if serde_json::to_writer(&mut chunk, &po.value).is_err() {
                    continue;
                }
                emitted = true;
                if tx.send(Bytes::from(chunk)).await.is_err() {
                    // The client went away; keep draining so the pipeline
                    // can finish, but stop building output.
                    client_gone = true;
                }
            }
            res = &mut walk_err, if !walk_done => {
                walk_done = true;
                terminal = res.unwrap_or(Err(SerieslyError::Internal(
                    "query walker dropped".to_string(),
                )));
            }
        }
    }

    if let Err(err) = terminal {
        warn!("query walk on {dbname} failed: {err}");
    }
    let _ = tx.send(Bytes::from_static(b"}")).await;
    info!(
        "completed query on {dbname} in {:?}, {} keys, {} chunks",
        start.elapsed(),
        total_keys.load(Ordering::Relaxed),
        started.load(Ordering::Relaxed)
    );
    drop(wd);
}
