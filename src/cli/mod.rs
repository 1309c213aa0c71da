//! Command-line interface for capvault.
//!
//! Provides commands for capturing fetch results, looking up manifests and
//! blobs, running processors, and maintaining the store.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::VaultConfig;
use crate::core::{ProcessReport, Vault};
use crate::domain::{
    BlobHash, FailureKind, FetchFailure, FetchResult, FetchedAsset, ManifestId, Relation, RunId,
};
use crate::store::ManifestRef;

/// capvault - capture-then-process storage for fetched web content
#[derive(Parser, Debug)]
#[command(name = "capvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Storage root (overrides config file and CAPVAULT_ROOT)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a fetched response and commit its manifest
    Capture {
        /// URL the response was fetched from
        url: String,

        /// Run ID (a new one is generated if omitted)
        #[arg(short, long)]
        run: Option<String>,

        /// HTTP status of the response (200 when a body is given)
        #[arg(short, long)]
        status: Option<u16>,

        /// Response body file (reads stdin if omitted and --no-body is not set)
        #[arg(short, long)]
        body: Option<PathBuf>,

        /// The fetch produced no body
        #[arg(long, conflicts_with = "body")]
        no_body: bool,

        /// Response header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Asset as "URL=PATH" (repeatable); relation is guessed from the extension
        #[arg(short, long = "asset")]
        assets: Vec<String>,

        /// Record a fetch failure
        #[arg(long, value_enum)]
        failure: Option<FailureArg>,

        /// Failure message
        #[arg(long, requires = "failure")]
        message: Option<String>,

        /// Fetch duration in milliseconds
        #[arg(long, default_value = "0")]
        duration_ms: u64,
    },

    /// Show a manifest
    Show {
        /// Manifest ID
        manifest_id: String,
    },

    /// Find manifests by URL or blob hash
    Find {
        /// URL to look up
        #[arg(short, long, conflicts_with = "hash", required_unless_present = "hash")]
        url: Option<String>,

        /// Restrict a URL lookup to one run
        #[arg(short, long, requires = "url")]
        run: Option<String>,

        /// Blob hash to look up (primary body or asset)
        #[arg(long)]
        hash: Option<String>,
    },

    /// Write a blob's verified bytes to stdout or a file
    Blob {
        /// Blob hash
        hash: String,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run processors over a run's manifests
    Process {
        /// Run ID
        run: String,

        /// Processor name or glob (repeatable; all when omitted)
        #[arg(short, long = "processor")]
        processors: Vec<String>,
    },

    /// Re-run processing and compare with the previous output
    Replay {
        /// Run ID
        run: String,

        /// Processor name or glob (repeatable; all when omitted)
        #[arg(short, long = "processor")]
        processors: Vec<String>,
    },

    /// List runs
    Runs,

    /// Show a run's outcome counts from its journal
    Summary {
        /// Run ID
        run: String,
    },

    /// Show storage statistics
    Stats,

    /// Rebuild the catalog from the manifest tree
    RebuildCatalog,

    /// Retention: delete runs and repair reference counts
    Retain {
        #[command(subcommand)]
        command: RetainCommands,
    },

    /// Remove temp files abandoned by crashed writers
    Sweep {
        /// Minimum age in seconds
        #[arg(long, default_value = "3600")]
        older_than: u64,
    },

    /// List registered processors
    Processors,

    /// Show resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum RetainCommands {
    /// Delete a run and release its blob references
    Drop {
        /// Run ID
        run: String,
    },

    /// Recompute reference counts from manifests and remove orphaned blobs
    Reconcile,
}

/// Fetch failure kind for CLI (maps to FailureKind)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FailureArg {
    /// Non-2xx response
    HttpStatus,
    Timeout,
    Connection,
    MalformedBody,
    Other,
}

impl From<FailureArg> for FailureKind {
    fn from(f: FailureArg) -> Self {
        match f {
            FailureArg::HttpStatus => FailureKind::HttpStatus,
            FailureArg::Timeout => FailureKind::Timeout,
            FailureArg::Connection => FailureKind::Connection,
            FailureArg::MalformedBody => FailureKind::MalformedBody,
            FailureArg::Other => FailureKind::Other,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = resolve_config(self.root)?;

        match self.command {
            Commands::Config => show_config(&config),
            Commands::Capture {
                url,
                run,
                status,
                body,
                no_body,
                headers,
                assets,
                failure,
                message,
                duration_ms,
            } => {
                let vault = open_vault(config)?;
                let run_id = match run {
                    Some(run) => parse_run(&run)?,
                    None => RunId::generate(),
                };
                let body = if no_body {
                    None
                } else {
                    Some(read_body(body.as_deref())?)
                };
                let fetch = build_fetch(
                    run_id,
                    url,
                    status,
                    body,
                    &headers,
                    &assets,
                    failure.map(|f| FetchFailure::new(f.into(), message.unwrap_or_default())),
                    duration_ms,
                )?;
                capture(&vault, fetch).await
            }
            Commands::Show { manifest_id } => show_manifest(&open_vault(config)?, &manifest_id).await,
            Commands::Find { url, run, hash } => {
                find_manifests(&open_vault(config)?, url, run, hash).await
            }
            Commands::Blob { hash, output } => {
                write_blob(&open_vault(config)?, &hash, output.as_deref()).await
            }
            Commands::Process { run, processors } => {
                let vault = open_vault(config)?;
                let report = vault.process_run(&parse_run(&run)?, &processors).await?;
                print_report(&report, false);
                Ok(())
            }
            Commands::Replay { run, processors } => {
                let vault = open_vault(config)?;
                let report = vault.replay(&parse_run(&run)?, &processors).await?;
                print_report(&report, true);
                Ok(())
            }
            Commands::Runs => list_runs(&open_vault(config)?).await,
            Commands::Summary { run } => {
                let vault = open_vault(config)?;
                let summary = vault.run_summary(&parse_run(&run)?).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            }
            Commands::Stats => {
                let stats = open_vault(config)?.stats().await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            }
            Commands::RebuildCatalog => {
                let count = open_vault(config)?
                    .rebuild_catalog()
                    .await
                    .context("Failed to rebuild catalog")?;
                println!("Catalog rebuilt from {} manifests", count);
                Ok(())
            }
            Commands::Retain { command } => retain(&open_vault(config)?, command).await,
            Commands::Sweep { older_than } => {
                let removed = open_vault(config)?
                    .retention()
                    .sweep_temp(Duration::from_secs(older_than))
                    .await?;
                println!("Removed {} temp files", removed);
                Ok(())
            }
            Commands::Processors => {
                let vault = open_vault(config)?;
                for name in vault.processors().names() {
                    if let Some(processor) = vault.processors().get(name) {
                        println!("{:<20} v{}", name, processor.version());
                    }
                }
                Ok(())
            }
        }
    }
}

fn resolve_config(root: Option<PathBuf>) -> Result<VaultConfig> {
    let mut config = VaultConfig::load()?;
    if let Some(root) = root {
        config.root = root;
    }
    Ok(config)
}

fn open_vault(config: VaultConfig) -> Result<Vault> {
    let root = config.root.clone();
    Vault::open(config)
        .and_then(Vault::with_builtin_processors)
        .with_context(|| format!("Failed to open vault at {}", root.display()))
}

fn parse_run(run: &str) -> Result<RunId> {
    RunId::new(run).with_context(|| format!("Invalid run ID: {}", run))
}

fn read_body(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("Failed to read body file: {}", path.display())),
        None => {
            let mut buffer = Vec::new();
            io::stdin()
                .read_to_end(&mut buffer)
                .context("Failed to read body from stdin")?;
            Ok(buffer)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_fetch(
    run_id: RunId,
    url: String,
    status: Option<u16>,
    body: Option<Vec<u8>>,
    headers: &[String],
    assets: &[String],
    failure: Option<FetchFailure>,
    duration_ms: u64,
) -> Result<FetchResult> {
    let mut fetch = match (status, body) {
        (Some(status), Some(body)) => FetchResult::new(run_id, url, status, body),
        (Some(status), None) => {
            let mut fetch = FetchResult::new(run_id, url, status, Vec::new());
            fetch.body = None;
            fetch
        }
        // A body without a status is still a response
        (None, Some(body)) => FetchResult::new(run_id, url, 200, body),
        (None, None) => FetchResult::failed(
            run_id,
            url,
            FetchFailure::new(FailureKind::Other, "no response"),
        ),
    };

    if let Some(failure) = failure {
        fetch = fetch.with_failure(failure);
    }

    for header in headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("Header must be \"Name: value\": {}", header))?;
        fetch = fetch.with_header(name.trim(), value.trim());
    }

    for asset in assets {
        let (url, path) = asset
            .split_once('=')
            .with_context(|| format!("Asset must be \"URL=PATH\": {}", asset))?;
        let path = Path::new(path);
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read asset file: {}", path.display()))?;
        fetch = fetch.with_asset(FetchedAsset::new(url, guess_relation(path), bytes));
    }

    Ok(fetch.with_duration(duration_ms))
}

/// Asset relation from a file extension
fn guess_relation(path: &Path) -> Relation {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "ico" | "avif" => Relation::Image,
        "js" | "mjs" => Relation::Script,
        "css" => Relation::Stylesheet,
        "woff" | "woff2" | "ttf" | "otf" | "eot" => Relation::Font,
        "mp4" | "webm" | "mp3" | "ogg" | "wav" => Relation::Media,
        "html" | "htm" => Relation::Document,
        _ => Relation::Other,
    }
}

async fn capture(vault: &Vault, fetch: FetchResult) -> Result<()> {
    let outcome = vault.capture(fetch).await.context("Capture failed")?;

    println!("Manifest: {}", outcome.manifest_id);
    println!("Run:      {}", outcome.run_id);
    println!("Outcome:  {:?}", outcome.kind);
    if !outcome.catalogued && !outcome.is_duplicate() {
        eprintln!("[Catalog not updated; run `capvault rebuild-catalog` to index this capture]");
    }
    Ok(())
}

async fn show_manifest(vault: &Vault, manifest_id: &str) -> Result<()> {
    let id = ManifestId::parse(manifest_id)
        .with_context(|| format!("Invalid manifest ID: {}", manifest_id))?;
    let manifest = vault.get_manifest(&id).await?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

async fn find_manifests(
    vault: &Vault,
    url: Option<String>,
    run: Option<String>,
    hash: Option<String>,
) -> Result<()> {
    let refs = match (url, hash) {
        (Some(url), _) => {
            let run = run.as_deref().map(parse_run).transpose()?;
            vault.find_by_url(&url, run.as_ref()).await?
        }
        (None, Some(hash)) => {
            let hash = BlobHash::parse(&hash).context("Invalid blob hash")?;
            vault.find_by_hash(&hash).await?
        }
        (None, None) => anyhow::bail!("Provide --url or --hash"),
    };

    print_refs(&refs);
    Ok(())
}

fn print_refs(refs: &[ManifestRef]) {
    if refs.is_empty() {
        println!("No manifests found");
        return;
    }

    println!(
        "{:<34} {:<24} {:<8} {:<26} URL",
        "MANIFEST ID", "RUN", "STATUS", "CAPTURED"
    );
    println!("{}", "-".repeat(110));
    for r in refs {
        let status = r
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<34} {:<24} {:<8} {:<26} {}",
            r.manifest_id,
            r.run_id,
            status,
            r.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            r.url
        );
    }
}

async fn write_blob(vault: &Vault, hash: &str, output: Option<&Path>) -> Result<()> {
    let hash = BlobHash::parse(hash).context("Invalid blob hash")?;
    let bytes = vault.read_blob(&hash).await?;

    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&bytes).context("Failed to write to stdout")?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn print_report(report: &ProcessReport, replay: bool) {
    println!(
        "Run {}: {} manifests, {} processors",
        report.run_id,
        report.manifests,
        report.outputs.len()
    );
    for output in &report.outputs {
        let identical = match (replay, output.identical) {
            (false, _) => String::new(),
            (true, Some(true)) => "  identical".to_string(),
            (true, Some(false)) => "  CHANGED".to_string(),
            (true, None) => "  new".to_string(),
        };
        println!(
            "  {:<20} {:>6} records {:>4} errors  {}{}",
            output.processor,
            output.records,
            output.errors,
            &output.digest[..output.digest.len().min(16)],
            identical
        );
    }
}

async fn list_runs(vault: &Vault) -> Result<()> {
    let runs = vault.list_runs().await?;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:>10} {:>8} {:>10}",
        "RUN ID", "SUCCEEDED", "FAILED", "DUPLICATES"
    );
    println!("{}", "-".repeat(70));
    for run_id in runs {
        let summary = vault.run_summary(&run_id).await?;
        println!(
            "{:<38} {:>10} {:>8} {:>10}",
            run_id, summary.succeeded, summary.failed, summary.duplicates
        );
    }
    Ok(())
}

async fn retain(vault: &Vault, command: RetainCommands) -> Result<()> {
    let retention = vault.retention();
    match command {
        RetainCommands::Drop { run } => {
            let run_id = parse_run(&run)?;
            let report = retention
                .drop_run(&run_id)
                .await
                .with_context(|| format!("Failed to drop run {}", run_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        RetainCommands::Reconcile => {
            let report = retention.reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn show_config(config: &VaultConfig) -> Result<()> {
    let layout = config.layout();

    println!("capvault configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Root:      {}", layout.root().display());
    println!("  Blobs:     {}", layout.blobs_dir().display());
    println!("  Manifests: {}", layout.manifests_dir().display());
    println!("  Derived:   {}", layout.derived_dir().display());
    println!("  Catalog:   {}", layout.catalog_path().display());
    println!("  Journal:   {}", layout.journal_dir().display());
    println!();
    println!("Concurrency:");
    println!("  Max asset fan-out:  {}", config.concurrency.max_asset_fanout);
    println!("  Per origin:         {}", config.concurrency.per_origin);
    println!("  Processing workers: {}", config.concurrency.processing_workers);
    println!();
    println!(
        "Sharding: {} levels x {} hex chars",
        config.sharding.depth, config.sharding.width
    );
    println!(
        "Catalog:  {}",
        if config.catalog_enabled { "enabled" } else { "disabled" }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> RunId {
        RunId::new("r").unwrap()
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_fetch_success() {
        let fetch = build_fetch(
            run(),
            "https://a.example/".to_string(),
            Some(200),
            Some(b"hi".to_vec()),
            &["Content-Type: text/html; charset=utf-8".to_string()],
            &[],
            None,
            5,
        )
        .unwrap();

        assert!(fetch.failure.is_none());
        assert_eq!(fetch.headers[0].value, "text/html; charset=utf-8");
        assert_eq!(fetch.fetch_duration_ms, 5);
    }

    #[test]
    fn test_build_fetch_failure_without_response() {
        let fetch = build_fetch(
            run(),
            "https://a.example/".to_string(),
            None,
            None,
            &[],
            &[],
            Some(FetchFailure::new(FailureKind::Timeout, "30s")),
            0,
        )
        .unwrap();

        assert_eq!(fetch.status, None);
        assert!(fetch.body.is_none());
        assert_eq!(fetch.failure.unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn test_build_fetch_rejects_bad_header() {
        assert!(build_fetch(
            run(),
            "https://a.example/".to_string(),
            Some(200),
            Some(Vec::new()),
            &["no colon".to_string()],
            &[],
            None,
            0,
        )
        .is_err());
    }

    #[test]
    fn test_guess_relation() {
        assert_eq!(guess_relation(Path::new("logo.PNG")), Relation::Image);
        assert_eq!(guess_relation(Path::new("app.js")), Relation::Script);
        assert_eq!(guess_relation(Path::new("site.css")), Relation::Stylesheet);
        assert_eq!(guess_relation(Path::new("README")), Relation::Other);
    }
}
