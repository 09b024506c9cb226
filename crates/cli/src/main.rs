use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ldata_core::{
    DEFAULT_PART_BYTES, DownloadRequest, HttpTransferApi, HttpTransferApiConfig, ProgressMode,
    ProgressTracker, RemotePath, RetryPolicy, TransferOptions, TransferSettings, TransferSummary,
    TransferApi, UploadRequest, default_worker_count, resolve_remote, run_download_with,
    run_upload_with,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod render;

use render::ProgressRenderer;

#[derive(Parser)]
#[command(name = "ldata")]
#[command(about = "Copy files and directory trees to and from the Latch content store", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long, short)]
    verbose: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Copy between a local path and a latch:// path. Interrupted or failed
    /// downloads leave partial files on disk for inspection.
    Cp {
        src: String,
        dst: String,
        #[arg(long, value_enum, default_value = "total")]
        progress: ProgressArg,
        /// Worker count override (default: 2x cores, capped at 16).
        #[arg(long)]
        cores: Option<usize>,
        #[arg(long)]
        chunk_size_mib: Option<u64>,
        /// Overwrite existing local files on download.
        #[arg(long)]
        force: bool,
    },
    /// Print a presigned URL for a remote object.
    Url { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProgressArg {
    None,
    Total,
    Tasks,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::None => ProgressMode::None,
            ProgressArg::Total => ProgressMode::Total,
            ProgressArg::Tasks => ProgressMode::Tasks,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Settings {
    api_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "https://nucleus.latch.bio".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = std::env::var("LDATA_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("LDATA_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);

    match cli.cmd {
        Command::Cp {
            src,
            dst,
            progress,
            cores,
            chunk_size_mib,
            force,
        } => {
            cp(
                &config_dir,
                CpArgs {
                    src,
                    dst,
                    progress: progress.into(),
                    cores,
                    chunk_size_mib,
                    force,
                    json: cli.json,
                },
            )
            .await
        }
        Command::Url { path } => url(&config_dir, &path, cli.json).await,
    }
}

struct CpArgs {
    src: String,
    dst: String,
    progress: ProgressMode,
    cores: Option<usize>,
    chunk_size_mib: Option<u64>,
    force: bool,
    json: bool,
}

async fn cp(config_dir: &Path, args: CpArgs) -> Result<(), CliError> {
    let src_remote = RemotePath::is_remote(&args.src);
    let dst_remote = RemotePath::is_remote(&args.dst);
    if src_remote == dst_remote {
        return Err(CliError::new(
            "args.invalid",
            "cp needs exactly one latch:// operand (local->remote uploads, remote->local downloads)",
        ));
    }

    let api = build_api(config_dir)?;
    let workers = args.cores.unwrap_or_else(default_worker_count);
    let settings = TransferSettings {
        part_bytes: args
            .chunk_size_mib
            .map(|mib| mib * 1024 * 1024)
            .unwrap_or(DEFAULT_PART_BYTES),
        workers,
    };

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let tracker = Arc::new(ProgressTracker::new(args.progress, workers));
    let renderer = if args.json {
        None
    } else {
        ProgressRenderer::spawn(Arc::clone(&tracker))
    };

    let options = TransferOptions {
        cancel: Some(&cancel),
        tracker: Some(&tracker),
    };
    let result = if dst_remote {
        let dest = RemotePath::parse(&args.dst).map_err(map_core_err)?;
        run_upload_with(
            &api,
            UploadRequest {
                source: PathBuf::from(&args.src),
                dest,
                settings,
            },
            options,
        )
        .await
    } else {
        let source = RemotePath::parse(&args.src).map_err(map_core_err)?;
        run_download_with(
            &api,
            DownloadRequest {
                source,
                dest: PathBuf::from(&args.dst),
                force: args.force,
                settings,
            },
            options,
        )
        .await
    };

    if let Some(renderer) = renderer {
        renderer.finish().await;
    }
    let summary = result.map_err(map_core_err)?;
    print_summary(&summary, args.json)?;
    Ok(())
}

async fn url(config_dir: &Path, path: &str, json: bool) -> Result<(), CliError> {
    let api = build_api(config_dir)?;
    let remote = RemotePath::parse(path).map_err(map_core_err)?;
    resolve_remote(&api, std::slice::from_ref(&remote), false)
        .await
        .map_err(map_core_err)?;
    let url = api.signed_url(remote.as_str()).await.map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "url": url }));
    } else {
        println!("{url}");
    }
    Ok(())
}

fn print_summary(summary: &TransferSummary, json: bool) -> Result<(), CliError> {
    if json {
        println!(
            "{}",
            serde_json::to_string(summary)
                .map_err(|e| CliError::new("unknown", e.to_string()))?
        );
    } else {
        println!(
            "{} files ({}) in {:.2}s",
            summary.num_files,
            format_bytes(summary.total_bytes),
            summary.elapsed_ms as f64 / 1000.0
        );
    }
    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, finishing in-flight chunks...");
            cancel.cancel();
        }
    });
}

fn build_api(config_dir: &Path) -> Result<HttpTransferApi, CliError> {
    let settings = load_settings(config_dir)?;
    let token = load_token(config_dir)?;
    Ok(HttpTransferApi::new(HttpTransferApiConfig {
        base_url: settings.api_url,
        token,
        retry: RetryPolicy::default(),
    }))
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".latch")
}

fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

fn load_settings(config_dir: &Path) -> Result<Settings, CliError> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings: Settings =
        toml::from_str(&text).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    Ok(settings)
}

fn load_token(config_dir: &Path) -> Result<String, CliError> {
    if let Ok(token) = std::env::var("LATCH_TOKEN") {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let path = config_dir.join("token");
    match std::fs::read_to_string(&path) {
        Ok(token) => {
            let token = token.trim().to_string();
            if token.is_empty() {
                Err(CliError::new("auth.missing", "token file is empty"))
            } else {
                Ok(token)
            }
        }
        Err(_) => Err(CliError::new(
            "auth.missing",
            format!(
                "no token found; set LATCH_TOKEN or write {}",
                path.display()
            ),
        )),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn map_core_err(e: ldata_core::Error) -> CliError {
    use ldata_core::Error;
    match e {
        Error::InvalidArgument { message } => CliError::new("args.invalid", message),
        Error::PathNotFound { path, account_id } => CliError::new(
            "path.not_found",
            format!("{path} does not exist (account {account_id})"),
        ),
        Error::AmbiguousPath { path, remainder } => CliError::new(
            "path.ambiguous",
            format!("{path}: more than one missing segment ({remainder})"),
        ),
        Error::Transient { message } => CliError::retryable("net.unavailable", message),
        Error::Api { message } => CliError::new("api.rejected", message),
        Error::Protocol { message } => CliError::new("protocol.violation", message),
        Error::Conflict { path } => CliError::new(
            "dest.conflict",
            format!("{} already exists (use --force to overwrite)", path.display()),
        ),
        Error::NonUtf8Path { path } => {
            CliError::new("args.invalid", format!("path is not UTF-8: {path:?}"))
        }
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        other @ (Error::Io(_) | Error::Walkdir(_)) => CliError::new("io.failed", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_sensible_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn settings_default_when_config_missing() {
        let temp = tempfile::tempdir().unwrap();
        let settings = load_settings(temp.path()).unwrap();
        assert_eq!(settings.api_url, "https://nucleus.latch.bio");
    }

    #[test]
    fn settings_load_from_toml() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(
            temp.path().join("config.toml"),
            "api_url = \"https://nucleus.example.dev\"\n",
        )
        .unwrap();
        let settings = load_settings(temp.path()).unwrap();
        assert_eq!(settings.api_url, "https://nucleus.example.dev");
    }
}
