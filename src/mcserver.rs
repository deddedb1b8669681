use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tracing::{info, warn};

use crate::{
    error::Result,
    protocol::{opcode, status, Request, Response},
    time,
    writer::WriterRegistry,
};

pub async fn listen(addr: &str, registry: Arc<WriterRegistry>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening for binary ingest connections on {addr}");
    listen_on(listener, registry).await
}

pub async fn listen_on(listener: TcpListener, registry: Arc<WriterRegistry>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((sock, peer)) => {
                info!("ingest connection from {peer}");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(err) = handle_session(sock, registry).await {
                        warn!("ingest session from {peer} ended: {err}");
                    }
                });
            }
            Err(err) => warn!("error accepting ingest connection: {err}"),
        }
    }
}

async fn handle_session(sock: TcpStream, registry: Arc<WriterRegistry>) -> Result<()> {
    let (mut read, mut write) = sock.into_split();
    let mut dbname = String::new();

    while let Some(req) = Request::read_from(&mut read).await? {
        if let Some(res) = handle_request(&req, &mut dbname, &registry).await {
            write.write_all(&res.encode()).await?;
        }
    }
    Ok(())
}

fn reply(req: &Request, status: u16, body: &str) -> Response {
    Response {
        opcode: req.opcode,
        status,
        opaque: req.opaque,
        body: Bytes::from(body.as_bytes().to_vec()),
        ..Response::default()
    }
}

/// Quiet ops answer only on error.
async fn handle_request(
    req: &Request,
    dbname: &mut String,
    registry: &Arc<WriterRegistry>,
) -> Option<Response> {
    match req.opcode {
        opcode::SELECT_BUCKET => {
            *dbname = String::from_utf8_lossy(&req.key).to_string();
            info!("ingest session selected database {dbname}");
            Some(reply(req, status::SUCCESS, ""))
        }
        opcode::SET | opcode::SETQ => {
            let key = if req.key.is_empty() {
                time::now_key()
            } else {
                let parsed = std::str::from_utf8(&req.key)
                    .ok()
                    .and_then(|s| time::parse_time(s).ok());
                match parsed {
                    Some(t) => time::format_canonical(t),
                    None => return Some(reply(req, status::EINVAL, "invalid key")),
                }
            };

            let stored = match registry.get_or_create(dbname) {
                Ok((writer, _)) => writer.store(key, req.body.to_vec()).await,
                Err(err) => Err(err),
            };
            match stored {
                Ok(()) => {
                    if req.opcode == opcode::SETQ {
                        None
                    } else {
                        Some(reply(req, status::SUCCESS, ""))
                    }
                }
                Err(err) => Some(reply(req, status::NOT_STORED, &err.to_string())),
            }
        }
        opcode::NOOP => Some(reply(req, status::SUCCESS, "")),
        _ => Some(reply(req, status::UNKNOWN_COMMAND, "")),
    }
}
