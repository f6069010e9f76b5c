//! Log filter selection and the rolling file sink. The app crate installs the
//! subscriber; this module only decides what it gets.
//!
//! The console follows the user's choice. The file sink additionally keeps
//! per-frame worker and task-store events at debug so a failed task can be
//! reconstructed from `<data_dir>/logs` after the fact.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Chatty dependencies and the ffmpeg stderr relay.
const NOISE_DIRECTIVES: &[&str] = &["ffmpeg_stderr=error", "hyper=warn", "tower_http=warn"];
const FILE_DETAIL_DIRECTIVES: &[&str] = &[
    "framefix_core::worker=debug",
    "framefix_core::task=debug",
    "framefix_core::extract=debug",
];
const VERBOSE_DEBUG_FILTER: &str = "info,framefix_core=debug,framefix_app=debug";
const VERBOSE_TRACE_FILTER: &str = "debug,framefix_core=trace,framefix_app=trace";

const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "framefix";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_RETENTION_FILES: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Server,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

/// What the user asked for, in decreasing precedence: `--log-filter`, `-v`,
/// `RUST_LOG`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub rust_log: Option<String>,
}

#[derive(Debug)]
pub struct LogPlan {
    pub console_filter: String,
    pub file_filter: String,
    pub file_sink: FileSink,
}

#[derive(Debug)]
pub enum FileSink {
    Rolling(RollingFileAppender),
    Unavailable {
        attempted_dir: Option<PathBuf>,
        reason: String,
    },
}

pub fn plan_logging(request: &LogRequest) -> LogPlan {
    let (console_filter, file_filter) = select_filters(request);
    LogPlan {
        console_filter,
        file_filter,
        file_sink: open_file_sink(request.data_dir.as_deref()),
    }
}

/// An explicit choice (`--log-filter` or `-v`) is used as given on both sinks.
/// Otherwise noise is muted and the file gets the per-frame detail.
fn select_filters(request: &LogRequest) -> (String, String) {
    let explicit = if let Some(filter) = request.cli_filter.as_deref() {
        Some(filter.to_string())
    } else {
        match request.verbose {
            0 => None,
            1 => Some(VERBOSE_DEBUG_FILTER.to_string()),
            _ => Some(VERBOSE_TRACE_FILTER.to_string()),
        }
    };
    if let Some(filter) = explicit {
        return (filter.clone(), filter);
    }

    let base = request
        .rust_log
        .as_deref()
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER);
    let console = join_directives(NOISE_DIRECTIVES, &[], base);
    let file = join_directives(NOISE_DIRECTIVES, FILE_DETAIL_DIRECTIVES, base);
    (console, file)
}

fn join_directives(noise: &[&str], detail: &[&str], base: &str) -> String {
    let mut directives: Vec<&str> = vec![base];
    directives.extend_from_slice(noise);
    directives.extend_from_slice(detail);
    directives.join(",")
}

fn open_file_sink(data_dir: Option<&Path>) -> FileSink {
    let Some(data_dir) = data_dir else {
        return FileSink::Unavailable {
            attempted_dir: None,
            reason: "no data dir configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Unavailable {
            attempted_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(&log_dir)
        .map_or_else(
            |error| FileSink::Unavailable {
                attempted_dir: Some(log_dir.clone()),
                reason: format!("failed to initialize rolling file sink: {error}"),
            },
            FileSink::Rolling,
        )
}
