use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use seriesly::{client::SerieslyClient, config, logging, server};

#[derive(Parser)]
#[command(author, version, about = "Seriesly time-series database")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start(StartArgs),
    /// Show server and database info from a running server
    Info(RemoteArgs),
    /// Dump a database to stdout
    Dump(DumpArgs),
    /// Load a previously dumped database
    Load(LoadArgs),
    /// Compact a database on a running server
    Compact(DbArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Address to bind to
    #[arg(long)]
    addr: Option<String>,

    /// Root directory for database files
    #[arg(long)]
    root: Option<PathBuf>,

    /// Binary ingest protocol bind address
    #[arg(long)]
    memcbind: Option<String>,

    /// Memcached server backing the query result cache
    #[arg(long)]
    memcache: Option<String>,

    /// Maximum time in ms to wait before flushing queued writes
    #[arg(long)]
    flush_delay_ms: Option<u64>,

    /// Maximum number of queued items before flushing
    #[arg(long)]
    max_op_queue: Option<usize>,

    /// Idle time in ms after which a database writer closes itself
    #[arg(long)]
    live_time_ms: Option<u64>,

    /// Maximum time in ms a query is allowed to process
    #[arg(long)]
    max_query_time_ms: Option<u64>,

    /// Number of query tree walkers
    #[arg(long)]
    query_workers: Option<usize>,

    /// Number of document processing workers
    #[arg(long)]
    doc_workers: Option<usize>,

    #[arg(long)]
    query_backlog: Option<usize>,

    #[arg(long)]
    doc_backlog: Option<usize>,

    #[arg(long)]
    cache_backlog: Option<usize>,

    #[arg(long)]
    cache_workers: Option<usize>,
}

#[derive(Args)]
struct RemoteArgs {
    /// Base URL of the server
    #[arg(long, default_value = "http://127.0.0.1:3133")]
    url: String,

    /// Restrict to one database
    db: Option<String>,
}

#[derive(Args)]
struct DbArgs {
    #[arg(long, default_value = "http://127.0.0.1:3133")]
    url: String,

    db: String,
}

#[derive(Args)]
struct DumpArgs {
    #[arg(long, default_value = "http://127.0.0.1:3133")]
    url: String,

    db: String,

    #[arg(long)]
    from: Option<String>,

    #[arg(long)]
    to: Option<String>,
}

#[derive(Args)]
struct LoadArgs {
    #[arg(long, default_value = "http://127.0.0.1:3133")]
    url: String,

    db: String,

    /// Dump file to read (`-` for stdin)
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => {
            let mut cfg = config::load_or_default(cli.config)?;
            apply_overrides(&mut cfg, args);
            server::run(cfg).await?;
        }
        Commands::Info(args) => {
            let client = SerieslyClient::new(&args.url);
            match args.db {
                Some(db) => {
                    let info = client.db_info(&db).await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                None => {
                    let info = client.server_info().await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                    for db in client.list_dbs().await? {
                        let info = client.db_info(&db).await?;
                        println!("{db}: {}", serde_json::to_string(&info)?);
                    }
                }
            }
        }
        Commands::Dump(args) => {
            let client = SerieslyClient::new(&args.url);
            let dump = client
                .dump(&args.db, args.from.as_deref(), args.to.as_deref())
                .await?;
            print!("{dump}");
        }
        Commands::Load(args) => {
            let client = SerieslyClient::new(&args.url);
            let contents = if args.file == PathBuf::from("-") {
                std::io::read_to_string(std::io::stdin())?
            } else {
                std::fs::read_to_string(&args.file)
                    .with_context(|| format!("reading {}", args.file.display()))?
            };
            let mut loaded = 0usize;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                let obj: Value = serde_json::from_str(line)
                    .with_context(|| format!("bad dump line: {line}"))?;
                let Some(map) = obj.as_object() else {
                    anyhow::bail!("bad dump line: {line}");
                };
                for (key, doc) in map {
                    client
                        .store_at(&args.db, key, serde_json::to_vec(doc)?)
                        .await?;
                    loaded += 1;
                }
            }
            eprintln!("loaded {loaded} documents into {}", args.db);
        }
        Commands::Compact(args) => {
            let client = SerieslyClient::new(&args.url);
            client.compact(&args.db).await?;
            eprintln!("compacted {}", args.db);
        }
    }

    Ok(())
}

fn apply_overrides(cfg: &mut config::Config, args: StartArgs) {
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if let Some(root) = args.root {
        cfg.root = root;
    }
    if let Some(memcbind) = args.memcbind {
        cfg.mc_addr = Some(memcbind);
    }
    if let Some(memcache) = args.memcache {
        cfg.cache_addr = Some(memcache);
    }
    if let Some(v) = args.flush_delay_ms {
        cfg.flush_delay_ms = v;
    }
    if let Some(v) = args.max_op_queue {
        cfg.max_op_queue = v;
    }
    if let Some(v) = args.live_time_ms {
        cfg.live_time_ms = v;
    }
    if let Some(v) = args.max_query_time_ms {
        cfg.query_timeout_ms = v;
    }
    if let Some(v) = args.query_workers {
        cfg.query_workers = v;
    }
    if let Some(v) = args.doc_workers {
        cfg.doc_workers = v;
    }
    if let Some(v) = args.query_backlog {
        cfg.query_backlog = v;
    }
    if let Some(v) = args.doc_backlog {
        cfg.doc_backlog = v;
    }
    if let Some(v) = args.cache_backlog {
        cfg.cache_backlog = v;
    }
    if let Some(v) = args.cache_workers {
        cfg.cache_workers = v;
    }
}
