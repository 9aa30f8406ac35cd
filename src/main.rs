use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use prometheus::Encoder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vault_cas::api::{ApiService, ApiState};
use vault_cas::auth::{SeedConfig, UserStore};
use vault_cas::blobstore::FsBlobStore;
use vault_cas::catalog::FileCatalog;
use vault_cas::inspect::{disk_space, num_keys};
use vault_cas::metastore::{Durability, MetaDb};
use vault_cas::metrics::SharedMetrics;
use vault_cas::thumbnail::NoThumbnails;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
pub struct ServerConfig {
    #[arg(long, default_value = ".")]
    blob_root: PathBuf,

    #[arg(long, default_value = ".")]
    meta_root: PathBuf,

    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value = "8014")]
    port: u16,

    #[arg(long, default_value = "localhost")]
    metric_host: String,

    #[arg(long, default_value = "9100")]
    metric_port: u16,

    #[arg(
        long,
        help = "Externally reachable base URL for download links (defaults to http://host:port)"
    )]
    public_url: Option<String>,

    #[arg(long, help = "TOML file with users to seed at startup")]
    users_file: Option<PathBuf>,

    #[arg(long, default_value = "3600", help = "Download URL lifetime in seconds")]
    download_ttl: u64,

    #[arg(
        long,
        default_value = "fdatasync",
        help = "Durability level (buffer, fsync, fdatasync)"
    )]
    durability: Durability,

    #[arg(
        long,
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace). Can also be set via RUST_LOG env var"
    )]
    log_level: String,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inspect DB
    Inspect {
        #[arg(long, default_value = ".")]
        meta_root: PathBuf,

        #[command(subcommand)]
        command: InspectCommand,
    },

    /// Start the storage server
    Server(ServerConfig),
}

#[derive(Debug, Subcommand)]
pub enum InspectCommand {
    // number of keys
    NumKeys,
    DiskSpace,
}

fn setup_tracing(log_level: &str) {
    // Try to use RUST_LOG env var first, fall back to CLI flag
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', falling back to 'info'", log_level);
            EnvFilter::new("info")
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Command::Server(config) => config.log_level.as_str(),
        _ => "info",
    };

    setup_tracing(log_level);

    match cli.command {
        Command::Inspect { command, meta_root } => match command {
            InspectCommand::NumKeys => {
                let counts = num_keys(meta_root)?;
                println!(
                    "Content entries: {}, catalog entries: {}, quota accounts: {}",
                    counts.content_entries, counts.catalog_entries, counts.quota_accounts
                );
            }
            InspectCommand::DiskSpace => {
                let disk_space = disk_space(meta_root)?;
                println!("Disk space: {disk_space}");
            }
        },
        Command::Server(config) => {
            run(config)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn run(args: ServerConfig) -> anyhow::Result<()> {
    let metrics = SharedMetrics::prometheus();

    let db = Arc::new(MetaDb::open(args.meta_root.join("meta"), args.durability)?);

    let public_url = args
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));
    let blobs = Arc::new(FsBlobStore::new(args.blob_root.join("blobs"), public_url));

    let users = UserStore::new(db.clone());
    if let Some(ref path) = args.users_file {
        let seed_config = SeedConfig::load_from_file(path)?;
        users.seed(&seed_config)?;
    }

    let catalog = FileCatalog::new(
        db.clone(),
        blobs.clone(),
        Arc::new(NoThumbnails),
        metrics.clone(),
        Duration::from_secs(args.download_ttl),
    );

    let api = ApiService::new(ApiState {
        catalog,
        users,
        downloads: Some(blobs.clone()),
        metrics: metrics.clone(),
    });

    // Background cleanup of expired download tokens
    {
        let blobs = blobs.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let removed = blobs.cleanup_expired_tokens();
                if removed > 0 {
                    tracing::debug!(removed = removed, "cleaned up expired download tokens");
                }
            }
        });
    }

    run_server(args, api).await
}

async fn run_server(args: ServerConfig, api: ApiService) -> anyhow::Result<()> {
    // API listener
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    let local_addr = listener.local_addr()?;

    // metrics server
    let metrics_listener =
        tokio::net::TcpListener::bind((args.metric_host.as_str(), args.metric_port)).await?;
    let metrics_addr = metrics_listener.local_addr()?;

    info!("metrics server is running at http://{metrics_addr}");

    let metrics_service = hyper::service::service_fn(
        move |req: hyper::Request<hyper::body::Incoming>| async move {
            match (req.method(), req.uri().path()) {
                (&hyper::Method::GET, "/metrics") => {
                    let mut buffer = Vec::new();
                    let encoder = prometheus::TextEncoder::new();
                    let metric_families = prometheus::gather();
                    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::error!("error encoding metrics: {err}");
                        return Ok::<_, std::convert::Infallible>(
                            hyper::Response::builder()
                                .status(500)
                                .body(Full::new(Bytes::from("encoding error")))
                                .unwrap(),
                        );
                    }

                    Ok::<_, std::convert::Infallible>(
                        hyper::Response::builder()
                            .status(200)
                            .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
                            .body(Full::new(Bytes::from(buffer)))
                            .unwrap(),
                    )
                }
                _ => Ok::<_, std::convert::Infallible>(
                    hyper::Response::builder()
                        .status(404)
                        .body(Full::new(Bytes::from("Not Found")))
                        .unwrap(),
                ),
            }
        },
    );

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    info!("server is running at http://{local_addr}");

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((socket, _)) => {
                        let api = api.clone();
                        let api_service = hyper::service::service_fn(move |req| {
                            let api = api.clone();
                            async move { api.handle_request(req).await }
                        });
                        let conn = http_server.serve_connection(TokioIo::new(socket), api_service);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            let _ = conn.await;
                        });
                        continue;
                    }
                    Err(err) => {
                        tracing::error!("error accepting connection: {err}");
                        continue;
                    }
                }
            }
            res = metrics_listener.accept() => {
                match res {
                    Ok((socket, _)) => {
                        let conn = http_server.serve_connection(TokioIo::new(socket), metrics_service);
                        let conn = graceful.watch(conn.into_owned());
                        tokio::spawn(async move {
                            let _ = conn.await;
                        });
                        continue;
                    }
                    Err(err) => {
                        tracing::error!("error accepting metrics connection: {err}");
                        continue;
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                break;
            }
        };
    }

    tokio::select! {
        () = graceful.shutdown() => {
             tracing::debug!("Gracefully shutdown!");
        },
        () = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
             tracing::debug!("Waited 10 seconds for graceful shutdown, aborting...");
        }
    }

    info!("server is stopped");
    Ok(())
}
