mod bars;

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use rangefetch_core::resume::ResumeRecord;
use rangefetch_core::{
    ChunkSizeTier, CoreError, DownloadEngine, DownloadRequest, DownloadTask, EngineConfig,
    JsonFileStore, ProgressView, ResumeStore, SqliteStore, TaskState,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::bars::BarView;

const DEFAULT_STATE_DIR: &str = ".rangefetch";

#[derive(Parser, Debug)]
#[command(name = "rangefetch", version, about = "Resumable multi-connection HTTP downloader")]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Directory holding JSON checkpoints
    #[arg(long, global = true, env = "RANGEFETCH_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// SQLite database holding checkpoints (instead of --state-dir)
    #[arg(long, global = true, env = "RANGEFETCH_DB", conflicts_with = "state_dir")]
    db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a URL
    Get(GetArgs),
    /// Show the stored checkpoint for a URL
    Status { url: String },
}

#[derive(Args, Debug)]
struct GetArgs {
    url: String,

    /// Destination path (defaults to the URL's file name)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Continue from a stored checkpoint when it still matches
    #[arg(long)]
    resume: bool,

    /// single, minimal, recommended, ludicrous or 1-4
    #[arg(long, env = "RANGEFETCH_CHUNKS", default_value = "recommended", value_parser = parse_tier)]
    chunks: ChunkSizeTier,

    /// Retries per chunk after the first attempt
    #[arg(long, env = "RANGEFETCH_RETRIES", default_value_t = 5)]
    retries: u32,

    /// Extra request header, `Name: value`
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    #[arg(long, env = "RANGEFETCH_PROXY")]
    proxy: Option<String>,

    /// Basic auth as `user:password`
    #[arg(long)]
    user: Option<String>,

    /// No progress bars
    #[arg(short, long)]
    quiet: bool,
}

fn parse_tier(value: &str) -> Result<ChunkSizeTier, String> {
    ChunkSizeTier::from_str(value).ok_or_else(|| format!("unknown chunk tier `{}`", value))
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let (name, content) = value
        .split_once(':')
        .ok_or_else(|| format!("header `{}` is not `Name: value`", value))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header `{}` has no name", value));
    }
    Ok((name.to_string(), content.trim().to_string()))
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Get(args) => run_get(&cli.store, args),
        Command::Status { url } => run_status(&cli.store, url),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = env::var("RANGEFETCH_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn open_store(args: &StoreArgs) -> Result<Box<dyn ResumeStore>, CoreError> {
    if let Some(db) = &args.db {
        return Ok(Box::new(SqliteStore::new(db.to_string_lossy().to_string())?));
    }
    let dir = args
        .state_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
    Ok(Box::new(JsonFileStore::new(dir)?))
}

fn run_get(store: &StoreArgs, args: &GetArgs) -> Result<ExitCode, CoreError> {
    let config = EngineConfig {
        max_chunks: args.chunks,
        retry_count: args.retries,
        ..EngineConfig::default()
    };
    let engine = DownloadEngine::new(config)?.with_store(open_store(store)?);

    let mut request = DownloadRequest::new(args.url.as_str());
    request.headers.extend(args.headers.iter().cloned());
    request.proxy = args.proxy.clone();
    if let Some(user) = &args.user {
        let (name, password) = user.split_once(':').unwrap_or((user.as_str(), ""));
        request.basic_auth = Some((name.to_string(), password.to_string()));
    }

    let dest = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(file_name_from_url(&args.url)));
    let mut task = DownloadTask::new(request, &dest, args.resume).with_maximum_chunk_size(args.chunks);

    let view = if args.quiet {
        None
    } else {
        let view = Arc::new(BarView::new(&dest.display().to_string()));
        let sink = Arc::clone(&view);
        task = task
            .on_progress(move |snapshot| sink.record(snapshot))
            .with_view(view.clone() as Arc<dyn ProgressView>);
        Some(view)
    };

    let cancel = task.cancel_handle();
    if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!(error = %err, "could not install Ctrl-C handler");
    }

    let result = engine.run(&task);
    if let Some(view) = &view {
        view.finish(task.state().as_str());
    }

    let report = result?;
    match report.state {
        TaskState::Completed => {
            if !args.quiet {
                println!(
                    "saved {} ({} bytes, {} chunk{}{})",
                    report.path.display(),
                    report.committed_bytes,
                    report.chunk_count,
                    if report.chunk_count == 1 { "" } else { "s" },
                    if report.degraded { ", server ignored ranges" } else { "" },
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        TaskState::Cancelled => {
            eprintln!(
                "cancelled after {} bytes; rerun with --resume to continue",
                report.committed_bytes
            );
            Ok(ExitCode::from(130))
        }
        state => {
            eprintln!("download ended in state {}", state);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_status(store: &StoreArgs, url: &str) -> Result<ExitCode, CoreError> {
    let engine = DownloadEngine::new(EngineConfig::default())?.with_store(open_store(store)?);
    match engine.resume_record(url)? {
        Some(record) => {
            print!("{}", describe(&record));
            Ok(ExitCode::SUCCESS)
        }
        None => {
            println!("no checkpoint for {}", url);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn describe(record: &ResumeRecord) -> String {
    let committed = record.committed_bytes();
    let percent = if record.total_bytes == 0 {
        100.0
    } else {
        committed as f64 * 100.0 / record.total_bytes as f64
    };
    let mut out = format!(
        "{}\n  validator: {}\n  progress:  {}/{} bytes ({:.1}%)\n",
        record.key,
        record.validator.as_deref().unwrap_or("-"),
        committed,
        record.total_bytes,
        percent,
    );
    if record.ranges_unsupported {
        out.push_str("  server ignores range requests\n");
    }
    for (index, chunk) in record.chunks.iter().enumerate() {
        out.push_str(&format!(
            "  #{} [{}, {}) {}/{}\n",
            index,
            chunk.range_start,
            chunk.range_end,
            chunk.bytes_committed,
            chunk.range_end.saturating_sub(chunk.range_start),
        ));
    }
    out
}

fn file_name_from_url(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                .map(|segment| segment.to_string())
        })
        .filter(|name| !name.contains(['/', '\\']) && name != "." && name != "..")
        .unwrap_or_else(|| "download".to_string())
}
