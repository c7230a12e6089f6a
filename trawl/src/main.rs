use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use trawl::config::{FilterRules, RunConfig};
use trawl::database::{MetadataValue, PostStatus, SessionStatus, StateManager};
use trawl::events::{
    ConsoleObserver, EmitterConfig, Event, EventEmitter, EventSelector, JsonlObserver, Observer,
    StatisticsObserver, TracingObserver,
};
use trawl::logging;
use trawl::pipeline::stages::{
    AcquisitionStage, FilterStage, HttpFetcher, JsonLinesSource, ProcessingStage,
};
use trawl::pipeline::{Pipeline, PipelineContext};
use trawl::recovery::{
    DEFAULT_CLEANUP_MAX_AGE_DAYS, DEFAULT_RESUME_MAX_AGE_DAYS, SessionRecovery,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database URL, e.g. sqlite:trawl.db?mode=rwc
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Append every event as one JSON line to this file
    #[arg(long, global = true, value_name = "PATH")]
    json_events: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Harvest a target: discover posts, filter them, download media
    Run {
        /// Target identifier, e.g. a username
        target: String,

        /// Kind of target, e.g. user or feed
        #[arg(long, default_value = "user")]
        target_type: String,

        /// File with one JSON post per line
        #[arg(short, long)]
        input: PathBuf,

        /// Directory downloaded media is written to
        #[arg(short, long, default_value = "downloads")]
        output_dir: PathBuf,

        /// Stop after this many posts
        #[arg(long)]
        limit: Option<usize>,

        /// Concurrent downloads
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Drop posts scoring below this
        #[arg(long)]
        min_score: Option<i64>,

        /// Drop posts scoring above this
        #[arg(long)]
        max_score: Option<i64>,

        /// Keep only posts created at or after this RFC 3339 instant
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// Keep only posts created before this RFC 3339 instant
        #[arg(long)]
        before: Option<DateTime<Utc>>,

        /// Keep only posts whose title contains one of these
        #[arg(long = "include-keyword", value_name = "WORD")]
        include_keywords: Vec<String>,

        /// Drop posts whose title contains any of these
        #[arg(long = "exclude-keyword", value_name = "WORD")]
        exclude_keywords: Vec<String>,

        /// Drop posts marked NSFW
        #[arg(long)]
        no_nsfw: bool,
    },

    /// Continue an interrupted session
    Resume {
        /// Session id; picks the newest resumable session when omitted
        session_id: Option<String>,

        /// Ignore sessions older than this many days
        #[arg(long, default_value_t = DEFAULT_RESUME_MAX_AGE_DAYS)]
        max_age_days: i64,
    },

    /// List stored sessions
    Sessions {
        /// Filter by status (active, paused, completed, failed)
        #[arg(long)]
        status: Option<SessionStatus>,

        /// Filter by target kind
        #[arg(long)]
        target_type: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Reconcile a session's download rows with the files on disk
    Repair {
        session_id: String,
    },

    /// Recompute checksums for a session's completed downloads
    Verify {
        session_id: String,
    },

    /// Delete completed and failed sessions older than the cutoff
    Cleanup {
        #[arg(long, default_value_t = DEFAULT_CLEANUP_MAX_AGE_DAYS)]
        max_age_days: i64,
    },

    /// Write a session and all of its rows to a JSON file
    Export {
        session_id: String,

        /// Output file
        #[arg(short, long, default_value = "session-export.json")]
        output: PathBuf,
    },

    /// Database self-check plus a resumable-session summary
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose, args.quiet);
    dotenvy::dotenv().ok();

    let db_url = args
        .db
        .clone()
        .or_else(|| std::env::var("TRAWL_DB_URL").ok())
        .unwrap_or_else(|| "sqlite:trawl.db?mode=rwc".to_string());
    let state = Arc::new(StateManager::open(&db_url).await?);

    let Args {
        verbose,
        quiet,
        json_events,
        command,
        ..
    } = args;

    let result = match command {
        Commands::Run {
            target,
            target_type,
            input,
            output_dir,
            limit,
            concurrency,
            min_score,
            max_score,
            after,
            before,
            include_keywords,
            exclude_keywords,
            no_nsfw,
        } => {
            let config = RunConfig {
                target_type,
                target_value: target,
                input: Some(input.to_string_lossy().into_owned()),
                output_dir: output_dir.to_string_lossy().into_owned(),
                limit,
                concurrency,
                filters: FilterRules {
                    min_score,
                    max_score,
                    after,
                    before,
                    include_keywords,
                    exclude_keywords,
                    allow_nsfw: !no_nsfw,
                },
            };
            cmd_run(&state, json_events.as_deref(), quiet, verbose, config).await
        }
        Commands::Resume {
            session_id,
            max_age_days,
        } => {
            cmd_resume(
                &state,
                json_events.as_deref(),
                quiet,
                verbose,
                session_id,
                max_age_days,
            )
            .await
        }
        Commands::Sessions {
            status,
            target_type,
            limit,
        } => cmd_sessions(&state, status, target_type.as_deref(), limit).await,
        Commands::Repair { session_id } => cmd_repair(&state, &session_id).await,
        Commands::Verify { session_id } => cmd_verify(&state, &session_id).await,
        Commands::Cleanup { max_age_days } => cmd_cleanup(&state, max_age_days).await,
        Commands::Export { session_id, output } => cmd_export(&state, &session_id, &output).await,
        Commands::Doctor => cmd_doctor(&state).await,
    };

    state.close().await;
    result
}

/// Emitter wired with the observers the flags ask for.
///
/// Quiet runs swap the console narration for tracing so failures still
/// reach the logs.
fn build_emitter(
    json_events: Option<&Path>,
    quiet: bool,
    verbose: bool,
) -> anyhow::Result<(Arc<EventEmitter>, Arc<StatisticsObserver>)> {
    let emitter = Arc::new(EventEmitter::new(EmitterConfig::default()));

    if quiet {
        let observer: Arc<dyn Observer> = Arc::new(TracingObserver::new());
        emitter.subscribe(EventSelector::All, &observer, false);
    } else {
        let observer: Arc<dyn Observer> = Arc::new(ConsoleObserver::new(quiet, verbose));
        emitter.subscribe(EventSelector::All, &observer, false);
    }

    let stats = Arc::new(StatisticsObserver::new());
    let stats_observer: Arc<dyn Observer> = stats.clone();
    emitter.subscribe(EventSelector::All, &stats_observer, false);

    if let Some(path) = json_events {
        let jsonl: Arc<dyn Observer> = Arc::new(JsonlObserver::new(path)?);
        emitter.subscribe(EventSelector::All, &jsonl, false);
    }

    Ok((emitter, stats))
}

/// Execute a prepared pipeline and settle the session afterwards.
///
/// A clean run completes the session; a stage failure pauses it so the
/// remaining work stays resumable. Configuration rejections fail it.
async fn drive(
    state: &StateManager,
    emitter: &Arc<EventEmitter>,
    stats: &Arc<StatisticsObserver>,
    pipeline: &Pipeline,
    ctx: &mut PipelineContext,
) -> anyhow::Result<()> {
    let session_id = ctx.session_id.clone();
    let metrics = match pipeline.execute(ctx).await {
        Ok(metrics) => metrics,
        Err(error) => {
            state
                .update_session_status(&session_id, SessionStatus::Failed)
                .await?;
            emitter.shutdown().await;
            return Err(error.into());
        }
    };

    let final_status = if metrics.success() {
        SessionStatus::Completed
    } else {
        SessionStatus::Paused
    };
    state
        .update_session_status(&session_id, final_status)
        .await?;
    let wall_seconds =
        Utc::now().signed_duration_since(ctx.started_at).num_milliseconds() as f64 / 1000.0;
    state
        .set_metadata(
            &session_id,
            "runtime_seconds",
            &MetadataValue::from(wall_seconds),
        )
        .await?;
    // Counters come from the stage results, not the observer, so the
    // stored numbers never depend on dispatch timing.
    let counter_keys = [
        ("post_count", "posts_discovered"),
        ("posts_filtered", "posts_filtered"),
        ("downloads_completed", "downloads_completed"),
        ("downloads_failed", "downloads_failed"),
        ("bytes_downloaded", "bytes_downloaded"),
    ];
    for result in &metrics.results {
        for (data_key, meta_key) in counter_keys {
            if let Some(value) = result.get_data(data_key).and_then(|value| value.as_i64()) {
                state
                    .set_metadata(&session_id, meta_key, &MetadataValue::from(value))
                    .await?;
            }
        }
    }

    let first_error = metrics
        .results
        .iter()
        .flat_map(|result| result.errors.iter())
        .next()
        .cloned();
    if let Some(error) = &first_error {
        state
            .set_metadata(&session_id, "last_error", &MetadataValue::from(error.as_str()))
            .await?;
    }

    emitter
        .emit_sync(Event::new(stats.to_payload()).with_session(session_id.as_str()))
        .await?;
    emitter.shutdown().await;

    let totals = stats.snapshot();
    println!(
        "{} posts discovered, {} filtered out, {} downloads ({} failed), {} bytes in {:.1}s",
        totals.posts_discovered,
        totals.posts_filtered,
        totals.downloads_completed,
        totals.downloads_failed,
        totals.bytes_downloaded,
        totals.elapsed.as_secs_f64(),
    );

    match final_status {
        SessionStatus::Completed => {
            println!("Session {session_id} completed");
            Ok(())
        }
        _ => {
            println!("Session {session_id} paused, resume it with: trawl resume {session_id}");
            Err(anyhow::anyhow!(
                "run stopped early: {}",
                first_error.unwrap_or_else(|| "stage failed".to_string())
            ))
        }
    }
}

async fn cmd_run(
    state: &Arc<StateManager>,
    json_events: Option<&Path>,
    quiet: bool,
    verbose: bool,
    config: RunConfig,
) -> anyhow::Result<()> {
    config.validate()?;
    let input = config
        .input
        .clone()
        .context("run requires an input file")?;

    let session_id = state
        .create_session(
            &config.target_type,
            &config.target_value,
            &config.config_hash()?,
        )
        .await?;
    state
        .set_metadata(
            &session_id,
            "run_config",
            &MetadataValue::from(serde_json::to_value(&config)?),
        )
        .await?;
    println!(
        "Session {session_id} started for {}:{}",
        config.target_type, config.target_value
    );

    let (emitter, stats) = build_emitter(json_events, quiet, verbose)?;
    let pipeline = Pipeline::new()
        .add_stage(AcquisitionStage::new(Arc::new(JsonLinesSource::new(input))))
        .add_stage(FilterStage::new(config.filters.clone()))
        .add_stage(ProcessingStage::new(
            Arc::new(HttpFetcher::new()?),
            config.concurrency,
        ));

    let mut ctx = PipelineContext::new(config, Arc::clone(&emitter))
        .attach_state(Arc::clone(state), session_id);
    drive(state, &emitter, &stats, &pipeline, &mut ctx).await
}

async fn cmd_resume(
    state: &Arc<StateManager>,
    json_events: Option<&Path>,
    quiet: bool,
    verbose: bool,
    session_id: Option<String>,
    max_age_days: i64,
) -> anyhow::Result<()> {
    let recovery = SessionRecovery::new(Arc::clone(state));
    let session_id = match session_id {
        Some(id) => id,
        None => {
            let found = recovery
                .find_resumable_sessions(Some(max_age_days))
                .await?;
            let Some(newest) = found.first() else {
                println!("No resumable sessions found");
                return Ok(());
            };
            newest.session().id.clone()
        }
    };

    let report = recovery.resume_session(&session_id).await?;
    println!(
        "Resuming session {session_id}: {} pending posts, {} failed downloads",
        report.pending_posts, report.failed_downloads
    );

    let config = stored_run_config(state, &session_id).await?;
    let records = state
        .get_posts(&session_id, Some(PostStatus::Pending))
        .await?;
    let mut posts = Vec::with_capacity(records.len());
    for record in &records {
        posts.push(record.post()?);
    }

    // Acquisition already ran in the original session; re-drive the rest.
    let (emitter, stats) = build_emitter(json_events, quiet, verbose)?;
    let pipeline = Pipeline::new()
        .add_stage(FilterStage::new(config.filters.clone()))
        .add_stage(ProcessingStage::new(
            Arc::new(HttpFetcher::new()?),
            config.concurrency,
        ));
    let mut ctx = PipelineContext::new(config, Arc::clone(&emitter))
        .attach_state(Arc::clone(state), session_id);
    ctx.posts = posts;
    drive(state, &emitter, &stats, &pipeline, &mut ctx).await
}

async fn stored_run_config(state: &StateManager, session_id: &str) -> anyhow::Result<RunConfig> {
    match state.get_metadata(session_id, "run_config").await? {
        Some(MetadataValue::Json(value)) => Ok(serde_json::from_value(value)?),
        _ => anyhow::bail!("session {session_id} has no stored run configuration"),
    }
}

async fn cmd_sessions(
    state: &Arc<StateManager>,
    status: Option<SessionStatus>,
    target_type: Option<&str>,
    limit: i64,
) -> anyhow::Result<()> {
    let sessions = state.list_sessions(status, target_type, limit).await?;
    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }
    for session in sessions {
        let resume = state.resume_state(&session.id).await?;
        let age = session
            .age_hours()
            .map(|hours| format!("{hours:.1}h"))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{}  {:9}  {}:{}  age {}  posts {} ({} pending, {} processed, {} skipped, {} failed)",
            session.id,
            session.status,
            session.target_type,
            session.target_value,
            age,
            resume.counts.total,
            resume.counts.pending,
            resume.counts.processed,
            resume.counts.skipped,
            resume.counts.failed,
        );
    }
    Ok(())
}

async fn cmd_repair(state: &Arc<StateManager>, session_id: &str) -> anyhow::Result<()> {
    let recovery = SessionRecovery::new(Arc::clone(state));
    let report = recovery.repair_session(session_id).await?;
    for issue in &report.issues_found {
        println!("issue: {issue}");
    }
    for repair in &report.repairs_performed {
        println!("fixed: {repair}");
    }
    Ok(())
}

async fn cmd_verify(state: &Arc<StateManager>, session_id: &str) -> anyhow::Result<()> {
    let recovery = SessionRecovery::new(Arc::clone(state));
    let report = recovery.validate_file_integrity(session_id).await?;
    println!(
        "checked {}: {} valid, {} missing, {} corrupted",
        report.checked, report.valid, report.missing, report.corrupted
    );
    for issue in &report.issues {
        println!("issue: {issue}");
    }
    if report.missing > 0 || report.corrupted > 0 {
        anyhow::bail!("file integrity check found problems");
    }
    Ok(())
}

async fn cmd_cleanup(state: &Arc<StateManager>, max_age_days: i64) -> anyhow::Result<()> {
    let recovery = SessionRecovery::new(Arc::clone(state));
    let report = recovery
        .cleanup_abandoned_sessions(Some(max_age_days))
        .await?;
    if report.removed.is_empty() {
        println!("Nothing to clean up");
    } else {
        println!("Removed {} sessions:", report.removed.len());
        for id in &report.removed {
            println!("  {id}");
        }
    }
    Ok(())
}

async fn cmd_export(
    state: &Arc<StateManager>,
    session_id: &str,
    output: &Path,
) -> anyhow::Result<()> {
    let recovery = SessionRecovery::new(Arc::clone(state));
    let report = recovery.export_session_data(session_id, output).await?;
    println!(
        "Exported session {} to {}: {} posts, {} downloads, {} metadata keys",
        report.session_id,
        report.path.display(),
        report.posts_exported,
        report.downloads_exported,
        report.metadata_keys,
    );
    Ok(())
}

async fn cmd_doctor(state: &Arc<StateManager>) -> anyhow::Result<()> {
    let report = state.integrity_report().await?;
    println!(
        "Database: {}",
        if report.ok { "ok" } else { "problems found" }
    );
    println!(
        "  {} sessions, {} posts, {} downloads, {} metadata rows",
        report.sessions, report.posts, report.downloads, report.metadata_rows
    );
    for issue in &report.issues {
        println!("  issue: {issue}");
    }

    let recovery = SessionRecovery::new(Arc::clone(state));
    let resumable = recovery.find_resumable_sessions(None).await?;
    if resumable.is_empty() {
        println!("No resumable sessions");
    } else {
        println!("Resumable sessions:");
        for entry in &resumable {
            let session = entry.session();
            println!(
                "  {}  {}:{}  {} pending  ({:.1}h old)",
                session.id,
                session.target_type,
                session.target_value,
                entry.state.counts.pending,
                entry.age_hours,
            );
        }
    }

    if !report.ok {
        anyhow::bail!("integrity check failed");
    }
    Ok(())
}
