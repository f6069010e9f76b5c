use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framefix_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use framefix_core::extract::ingest_video;
use framefix_core::logging::{self, FileSink, LogRequest, RuntimeLogMode, DEFAULT_LOG_FILTER};
use framefix_core::repos::RepoRegistry;
use framefix_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(
    name = "framefix",
    about = "Repair defective video frames by interpolating from their neighbors"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a video into a new frame repo and exit.
    Ingest(IngestArgs),
}

#[derive(Args)]
struct IngestArgs {
    #[arg(help = "Path to the source video")]
    video: PathBuf,
    #[arg(long = "repo-id", help = "Repo id to create (defaults to the video file stem)")]
    repo_id: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Ingest(args)) => run_ingest(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let plan = logging::plan_logging(&LogRequest {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log: std::env::var("RUST_LOG").ok(),
    });
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&plan.console_filter, "console"));

    match plan.file_sink {
        FileSink::Rolling(appender) => {
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&plan.file_filter, "file")),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}; logging disabled.");
            }
        }
        FileSink::Unavailable {
            attempted_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}; logging disabled.");
                return;
            }

            let attempted_dir = attempted_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_dir = %attempted_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!("Bad {sink_name} log filter '{filter}': {error}; using '{DEFAULT_LOG_FILTER}'.");
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);
    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = AppState::new(config, data_dir);
    let workers = state.spawn_workers()?;
    state.requeue_on_startup();

    let cancel = CancellationToken::new();
    let sweeper = state.spawn_task_sweeper(cancel.clone());

    let app = app_router(state);
    let addr = format!("{host}:{port}");
    info!(%addr, "Starting framefix server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "Task sweeper join failure");
    }
    workers.shutdown().await;
    info!("Server stopped");

    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run_ingest(args: IngestArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let repo_id = match args.repo_id {
        Some(repo_id) => repo_id,
        None => default_repo_id(&args.video)?,
    };

    let repos = RepoRegistry::new(config.resolved_repos_dir(&data_dir));
    let store = repos
        .create(&repo_id)
        .with_context(|| format!("failed to create repo '{repo_id}'"))?;
    let claim = store
        .claim_ingestion()
        .with_context(|| format!("repo '{repo_id}' is already populated or being ingested"))?;
    let scratch = data_dir.join("scratch");
    let video = args.video;

    let summary = tokio::task::spawn_blocking(move || ingest_video(&video, &claim, &scratch))
        .await
        .context("ingestion task failed")??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn default_repo_id(video: &Path) -> Result<String> {
    let stem = video
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("video path has no usable file name; pass --repo-id")?;
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    Ok(sanitized)
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn no_subcommand_runs_server_with_overrides() {
        let cli = Cli::try_parse_from(["framefix", "--port", "9001", "-vv"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9001));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn ingest_subcommand_parses_video_and_repo_id() {
        let cli = Cli::try_parse_from([
            "framefix",
            "ingest",
            "clip.mp4",
            "--repo-id",
            "clip-1",
            "--data-dir",
            "/tmp/ff",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Ingest(args)) => {
                assert_eq!(args.video, PathBuf::from("clip.mp4"));
                assert_eq!(args.repo_id.as_deref(), Some("clip-1"));
            }
            None => panic!("expected ingest subcommand"),
        }
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/ff")));
    }

    #[test]
    fn default_repo_id_sanitizes_file_stem() {
        assert_eq!(
            default_repo_id(Path::new("/videos/My Clip (v2).mp4")).unwrap(),
            "My_Clip__v2_"
        );
        assert!(default_repo_id(Path::new("/")).is_err());
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let filter = parse_env_filter_with_fallback("[[[", "console");
        assert_eq!(filter.to_string(), DEFAULT_LOG_FILTER);
    }
}
