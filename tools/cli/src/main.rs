//! AssetSync CLI - Command line interface for the sync engine.
//!
//! Runs sync cycles against the configured source of truth and cache,
//! inspects the cache, and submits guarded writes back to the source.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use assetsync_cache::{CacheStore, MemoryCache, RedisCache, RedisCacheConfig};
use assetsync_common::{AssetId, Category, Error, Fingerprint};
use assetsync_source::{create_default_registry, SourceOfTruth};
use assetsync_sync::{
    CycleReport, RetryConfig, RetryExecutor, SyncEngine, WriteBackOutcome, WriteOptions,
};

use crate::config::{LogFormat, Settings};

const DEFAULT_CONFIG: &str = "settings.yaml";
const EXIT_INVALID_RECORDS: u8 = 2;
const EXIT_CONFLICT: u8 = 3;

type Engine = SyncEngine<dyn SourceOfTruth, dyn CacheStore>;

#[derive(Parser)]
#[command(name = "assetsync")]
#[command(about = "AssetSync - Keep a Redis asset cache consistent with a Git repository")]
#[command(version)]
struct Cli {
    /// Settings file (default: settings.yaml, optional).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync cycle.
    Sync {
        /// Skip the scan when the source revision has not moved.
        #[arg(long)]
        incremental: bool,

        /// Keep running periodic cycles until interrupted.
        #[arg(long)]
        continuous: bool,
    },

    /// Check source, cache and category index health.
    Health,

    /// List cached asset summaries.
    List {
        /// Restrict to one category: "tool", "prompt" or "skill".
        #[arg(short = 'C', long)]
        category: Option<String>,
    },

    /// Show one cached asset.
    Get {
        /// Asset id.
        id: String,
    },

    /// Show recently changed asset ids, newest first.
    Changes {
        /// Number of entries.
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },

    /// Show the persisted sync state.
    Status,

    /// Create a new asset at the source of truth.
    Create {
        /// Manifest file to submit.
        manifest: PathBuf,

        #[arg(long)]
        author: Option<String>,

        /// Commit message override.
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Write an edited manifest back to the source of truth.
    WriteBack {
        /// Asset id.
        id: String,

        /// Manifest file to submit.
        manifest: PathBuf,

        /// Fingerprint the edit was based on.
        #[arg(long)]
        expected_fingerprint: String,

        /// Increment the patch version before writing.
        #[arg(long)]
        bump: bool,

        #[arg(long)]
        author: Option<String>,

        /// Commit message override.
        #[arg(short, long)]
        message: Option<String>,

        /// Retries when the source is unreachable. Conflicts are never retried.
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },

    /// Delete an asset at the source of truth.
    Delete {
        /// Asset id.
        id: String,

        /// Fingerprint the deletion was based on.
        #[arg(long)]
        expected_fingerprint: String,

        #[arg(long)]
        author: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;

    match run(cli).await {
        Ok(code) => code,
        Err(err) => report_failure(&err, json),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let (path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    let settings = Settings::load(&path, required).context("Failed to load settings")?;
    init_logging(cli.verbose, &settings)?;
    settings.validate().context("Invalid configuration")?;

    let engine = open_engine(&settings).await?;
    let json = cli.json;

    match cli.command {
        Commands::Sync {
            incremental,
            continuous,
        } => {
            if continuous {
                cmd_sync_continuous(engine).await
            } else {
                cmd_sync(&engine, incremental, json).await
            }
        }

        Commands::Health => cmd_health(&engine, json).await,

        Commands::List { category } => cmd_list(&engine, category.as_deref(), json).await,

        Commands::Get { id } => cmd_get(&engine, &id, json).await,

        Commands::Changes { count } => cmd_changes(&engine, count, json).await,

        Commands::Status => cmd_status(&engine, json).await,

        Commands::Create {
            manifest,
            author,
            message,
        } => {
            let options = WriteOptions {
                author,
                message,
                bump_version: false,
            };
            cmd_create(&engine, &manifest, &options, json).await
        }

        Commands::WriteBack {
            id,
            manifest,
            expected_fingerprint,
            bump,
            author,
            message,
            retries,
        } => {
            let options = WriteOptions {
                author,
                message,
                bump_version: bump,
            };
            let retry = RetryConfig::new(retries).with_initial_delay(settings.retry_delay());
            cmd_write_back(
                &engine,
                &id,
                &manifest,
                &expected_fingerprint,
                &options,
                retry,
                json,
            )
            .await
        }

        Commands::Delete {
            id,
            expected_fingerprint,
            author,
        } => {
            let options = WriteOptions {
                author,
                ..WriteOptions::default()
            };
            cmd_delete(&engine, &id, &expected_fingerprint, &options, json).await
        }
    }
}

/// Install the fmt subscriber. `RUST_LOG` wins over `--verbose`, which wins
/// over the configured level. Logs go to stderr so `--json` output stays clean.
fn init_logging(verbose: bool, settings: &Settings) -> Result<()> {
    let fallback = if verbose { "debug" } else { settings.log_level() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match settings.logging.format {
        LogFormat::Compact => tracing::subscriber::set_global_default(builder.compact().finish())?,
        LogFormat::Full => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

async fn open_engine(settings: &Settings) -> Result<Engine> {
    let source = create_default_registry()
        .resolve(&settings.source.kind, settings.source_config()?)
        .context("Failed to open source of truth")?;

    let cache: Arc<dyn CacheStore> = match settings.cache.kind.as_str() {
        "memory" => Arc::new(MemoryCache::with_change_log_capacity(
            settings.cache.change_log_capacity,
        )),
        _ => {
            let mut config = RedisCacheConfig::new(settings.redis_url());
            config.change_log_capacity = settings.cache.change_log_capacity;
            Arc::new(
                RedisCache::connect(config)
                    .await
                    .context("Failed to connect to cache store")?,
            )
        }
    };

    info!(source = source.name(), cache = cache.name(), "Stores opened");
    Ok(SyncEngine::from_arc(source, cache, settings.sync_config()?))
}

/// Map an error to its exit code, printing it the way the caller asked.
fn report_failure(err: &anyhow::Error, json: bool) -> ExitCode {
    let cause = err.chain().find_map(|e| e.downcast_ref::<Error>());

    if let Some(Error::Conflict {
        path,
        expected,
        current,
    }) = cause
    {
        if json {
            println!(
                "{}",
                json!({
                    "status": "conflict",
                    "reason": "conflict",
                    "path": path,
                    "expected": expected,
                    "current": current,
                })
            );
        } else {
            eprintln!("Conflict at {}: the asset changed since it was read.", path);
            eprintln!("  Expected: {}", expected);
            println!("Current fingerprint: {}", current);
        }
        return ExitCode::from(EXIT_CONFLICT);
    }

    let reason = cause.map(Error::reason).unwrap_or("error");
    if json {
        println!(
            "{}",
            json!({
                "status": "failed",
                "reason": reason,
                "message": format!("{:#}", err),
            })
        );
    } else {
        eprintln!("Error: {:#}", err);
    }
    ExitCode::FAILURE
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    if ts == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Run one cycle and print its report.
async fn cmd_sync(engine: &Engine, incremental: bool, json: bool) -> Result<ExitCode> {
    let report = if incremental {
        engine.sync_incremental().await
    } else {
        engine.sync_full().await
    }
    .context("Sync cycle failed")?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    if report.has_invalid() {
        Ok(ExitCode::from(EXIT_INVALID_RECORDS))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_report(report: &CycleReport) {
    if report.skipped {
        println!("Source unchanged at revision {}, nothing to do.", report.revision);
        return;
    }

    println!("Sync {} ({}) completed at revision {}", report.cycle_id, report.mode, report.revision);
    println!("  Created:   {}", report.created.len());
    println!("  Updated:   {}", report.updated.len());
    println!("  Deleted:   {}", report.deleted.len());
    println!("  Unchanged: {}", report.unchanged);
    println!("  Invalid:   {}", report.invalid_count);
    for invalid in &report.invalid {
        println!("    {}: {}", invalid.path, invalid.reasons.join("; "));
    }
    for inconsistency in &report.inconsistencies {
        println!("  Inconsistency: {}", inconsistency);
    }
    println!("  Took {} ms", report.duration_ms);
}

/// Run periodic cycles until Ctrl-C.
async fn cmd_sync_continuous(mut engine: Engine) -> Result<ExitCode> {
    let handle = engine.init_scheduler();
    let engine = Arc::new(engine);

    let worker = engine.clone();
    let task = tokio::spawn(handle.run(move |request| {
        let engine = worker.clone();
        async move { engine.process_request(request).await }
    }));

    info!(mode = ?engine.config().sync_mode, "Continuous sync started, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    engine.cancellation_token().cancel();
    if let Some(scheduler) = engine.scheduler() {
        scheduler.shutdown().await;
    }
    task.await.context("Scheduler task failed")?;

    Ok(ExitCode::SUCCESS)
}

async fn cmd_health(engine: &Engine, json: bool) -> Result<ExitCode> {
    let report = engine.health().await;
    let healthy = report.is_healthy();

    if json {
        print_json(&json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "report": report,
        }))?;
    } else {
        println!("Health: {}", if healthy { "healthy" } else { "unhealthy" });
        for component in [&report.source, &report.cache] {
            match &component.error {
                None => println!("  {}: ok", component.name),
                Some(e) => println!("  {}: {}", component.name, e),
            }
        }
        match &report.consistency {
            Some(c) if c.is_consistent() => println!("  Category index: consistent"),
            Some(c) => {
                println!("  Category index: inconsistent");
                println!("    Missing membership: {}", c.missing_membership.join(", "));
                println!("    Stray membership:   {}", c.stray_membership.join(", "));
                println!("    Missing detail:     {}", c.missing_detail.join(", "));
                println!("    Missing summary:    {}", c.missing_summary.join(", "));
                println!("    Unresolved:         {}", c.unresolved.join(", "));
            }
            None => println!("  Category index: unknown"),
        }
        if let Some(state) = &report.state {
            println!(
                "  Last sync: {} ({})",
                format_timestamp(state.last_sync_time),
                state.status.as_str()
            );
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_list(engine: &Engine, category: Option<&str>, json: bool) -> Result<ExitCode> {
    let category = category
        .map(|c| c.parse::<Category>())
        .transpose()
        .context("Invalid category")?;
    let summaries = engine.list(category).await.context("Failed to list assets")?;

    if json {
        print_json(&summaries)?;
    } else if summaries.is_empty() {
        println!("No assets cached.");
    } else {
        for summary in &summaries {
            println!(
                "  [{}] {} {} - {}",
                summary.category, summary.id, summary.version, summary.short_description
            );
        }
        println!("{} asset(s)", summaries.len());
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_get(engine: &Engine, id: &str, json: bool) -> Result<ExitCode> {
    let id = AssetId::new(id)?;
    let stored = engine
        .get(&id)
        .await
        .context("Failed to read asset")?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;
    let record = &stored.record;

    if json {
        print_json(&json!({
            "id": record.id,
            "name": record.name,
            "category": record.category,
            "version": record.version,
            "description": record.description,
            "author": record.author,
            "sourcePath": record.source_path,
            "contentFingerprint": record.content_fingerprint,
            "createdAt": stored.created_at,
            "updatedAt": stored.updated_at,
            "payload": record.payload,
        }))?;
    } else {
        println!("Asset {}:", record.id);
        println!("  Name: {}", record.name);
        println!("  Category: {}", record.category);
        println!("  Version: {}", record.version);
        if let Some(author) = &record.author {
            println!("  Author: {}", author);
        }
        println!("  Path: {}", record.source_path);
        println!("  Fingerprint: {}", record.content_fingerprint);
        println!("  Created: {}", format_timestamp(stored.created_at));
        println!("  Updated: {}", format_timestamp(stored.updated_at));
        println!("  Description: {}", record.description);
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_changes(engine: &Engine, count: usize, json: bool) -> Result<ExitCode> {
    let changes = engine
        .recent_changes(count)
        .await
        .context("Failed to read change log")?;

    if json {
        print_json(&changes)?;
    } else if changes.is_empty() {
        println!("No recent changes.");
    } else {
        for id in &changes {
            println!("  {}", id);
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(engine: &Engine, json: bool) -> Result<ExitCode> {
    let state = engine.status().await.context("Failed to read sync state")?;

    if json {
        print_json(&state)?;
    } else {
        println!("Sync state:");
        println!("  Status: {}", state.status.as_str());
        println!("  Last sync: {}", format_timestamp(state.last_sync_time));
        println!("  Revision: {}", state.last_revision_token);
        println!("  Records: {}", state.record_count);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_outcome(action: &str, outcome: &WriteBackOutcome, json: bool) -> Result<()> {
    if json {
        print_json(&json!({ "status": action, "outcome": outcome }))?;
    } else {
        println!("Asset {} {}", outcome.id, action);
        println!("  Path: {}", outcome.path);
        println!("  Version: {}", outcome.version);
        println!("  Fingerprint: {}", outcome.fingerprint);
    }
    Ok(())
}

async fn cmd_create(
    engine: &Engine,
    manifest: &PathBuf,
    options: &WriteOptions,
    json: bool,
) -> Result<ExitCode> {
    let content = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("Failed to read {}", manifest.display()))?;

    let outcome = engine
        .writer()
        .create(&content, options)
        .await
        .context("Create failed")?;
    print_outcome("created", &outcome, json)?;

    Ok(ExitCode::SUCCESS)
}

async fn cmd_write_back(
    engine: &Engine,
    id: &str,
    manifest: &PathBuf,
    expected: &str,
    options: &WriteOptions,
    retry: RetryConfig,
    json: bool,
) -> Result<ExitCode> {
    let id = AssetId::new(id)?;
    let expected = Fingerprint::new(expected);
    let content = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("Failed to read {}", manifest.display()))?;

    let outcome = RetryExecutor::new(retry)
        .execute_with_condition(
            || engine.writer().write_back(&id, &content, &expected, options),
            |e| matches!(e, Error::SourceUnavailable(_)),
        )
        .await
        .context("Write-back failed")?;
    print_outcome("updated", &outcome, json)?;

    Ok(ExitCode::SUCCESS)
}

async fn cmd_delete(
    engine: &Engine,
    id: &str,
    expected: &str,
    options: &WriteOptions,
    json: bool,
) -> Result<ExitCode> {
    let id = AssetId::new(id)?;
    let expected = Fingerprint::new(expected);

    let path = engine
        .writer()
        .delete(&id, &expected, options)
        .await
        .context("Delete failed")?;

    if json {
        print_json(&json!({ "status": "deleted", "id": id, "path": path }))?;
    } else {
        println!("Asset {} deleted ({})", id, path);
    }

    Ok(ExitCode::SUCCESS)
}
