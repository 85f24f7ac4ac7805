//! Process entrypoint (C13): load configuration, wire storage/queue/vector/
//! LLM/messaging, and run the worker loops, reconciler, and HTTP surface
//! side by side under one cooperative shutdown signal.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use supportbot::config::{Config, RuntimeConfig};
use supportbot::domain::{HistoryToken, JobKind};
use supportbot::history::HistoryBootstrap;
use supportbot::llm::LlmGateway;
use supportbot::messaging::NoopAdapter;
use supportbot::queue::JobQueue;
use supportbot::reconciler::Reconciler;
use supportbot::storage::Storage;
use supportbot::vector::VectorIndex;
use supportbot::workers::{BufferUpdateWorker, MaybeRespondWorker};

#[derive(Parser)]
#[command(name = "supportbot", about = "Group-chat support assistant")]
struct Cli {
    /// Path to a TOML config file overlaying environment variables.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion workers, reconciler, and HTTP surface (the default).
    Serve,
    /// Mint a history-bootstrap token for a group and print it.
    IssueHistoryToken {
        group_id: String,
        #[arg(long, default_value_t = 60)]
        ttl_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let _telemetry_guard = supportbot::telemetry::init(&config.telemetry)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::IssueHistoryToken { group_id, ttl_minutes } => {
            issue_history_token(config, group_id, ttl_minutes).await
        }
    }
}

async fn issue_history_token(config: Config, group_id: String, ttl_minutes: i64) -> anyhow::Result<()> {
    let pool = connect_pool(&config).await?;
    let storage = Storage::from_pool(pool);

    let token = HistoryToken {
        token: uuid::Uuid::new_v4().to_string(),
        group_id,
        expires_at: chrono::Utc::now() + chrono::Duration::minutes(ttl_minutes),
        used: false,
    };
    storage.create_history_token(&token).await?;
    println!("{}", token.token);
    Ok(())
}

async fn connect_pool(config: &Config) -> anyhow::Result<sqlx::SqlitePool> {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&config.sqlite_url())
        .await
        .with_context(|| format!("failed to connect to {}", config.sqlite_url()))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let storage = Storage::connect(&config.sqlite_url(), 8).await?;
    let queue = JobQueue::new(storage.pool().clone());

    let vector_uri = config.vector.path.to_string_lossy().to_string();
    let vector = Arc::new(VectorIndex::connect(&vector_uri, EMBEDDING_DIMENSION).await?);

    let runtime = Arc::new(RuntimeConfig::new(config.llm.clone()));
    let llm = Arc::new(LlmGateway::new(&config, Arc::clone(&runtime))?);
    let config_file_path = config.data_dir.join("config.toml");
    let _config_watcher = supportbot::config::watch_for_reload(Arc::clone(&runtime), config_file_path)
        .inspect_err(|err| tracing::warn!(error = %err, "config hot-reload watcher not started"))
        .ok();

    let messaging: Arc<dyn supportbot::messaging::MessagingDyn> = Arc::new(NoopAdapter::new());

    let history_bootstrap = Arc::new(HistoryBootstrap::new(
        storage.clone(),
        Arc::clone(&vector),
        Arc::clone(&llm),
        config.pipeline.clone(),
        config.timeouts,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let buffer_update_worker = BufferUpdateWorker::new(
        storage.clone(),
        queue.clone(),
        Arc::clone(&vector),
        Arc::clone(&llm),
    );
    let maybe_respond_worker = MaybeRespondWorker::new(
        storage.clone(),
        Arc::clone(&vector),
        Arc::clone(&llm),
        Arc::clone(&messaging),
        config.pipeline.clone(),
    );
    let reconciler = Reconciler::new(storage.clone(), Arc::clone(&vector), Arc::clone(&llm));

    let poll_interval = std::time::Duration::from_secs(config.pipeline.worker_poll_interval_secs);
    let job_total_deadline = std::time::Duration::from_secs(config.timeouts.job_total_secs);

    let buffer_update_handle = tokio::spawn(run_buffer_update_loop(
        queue.clone(),
        buffer_update_worker,
        poll_interval,
        job_total_deadline,
        shutdown_rx.clone(),
    ));

    let maybe_respond_handle = tokio::spawn(run_maybe_respond_loop(
        queue.clone(),
        maybe_respond_worker,
        poll_interval,
        job_total_deadline,
        shutdown_rx.clone(),
    ));

    let reconciler_interval = std::time::Duration::from_secs(config.pipeline.reconciler_interval_secs);
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { reconciler.run_forever(reconciler_interval, shutdown_rx).await }
    });

    let stale_claim_secs = config.pipeline.stale_claim_secs;
    let reclaim_handle = tokio::spawn(run_stale_claim_reclaim_loop(
        queue.clone(),
        stale_claim_secs,
        poll_interval,
        shutdown_rx.clone(),
    ));

    let api_state = supportbot::api::ApiState { storage: storage.clone(), history_bootstrap };
    let app = supportbot::api::router(api_state);
    let listener = tokio::net::TcpListener::bind(config.http_bind).await?;
    tracing::info!(addr = %config.http_bind, "HTTP surface listening");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(
        buffer_update_handle,
        maybe_respond_handle,
        reconciler_handle,
        reclaim_handle,
        server_handle
    );

    Ok(())
}

/// Periodically reclaim jobs stuck `in_progress` past the configured
/// staleness deadline back to `pending`, so a worker that died mid-job does
/// not strand it forever (SPEC_FULL.md §5, "abandoned" jobs).
async fn run_stale_claim_reclaim_loop(
    queue: JobQueue,
    stale_after_secs: u64,
    interval: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.reclaim_stale(stale_after_secs).await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "reclaimed stale in-progress jobs"),
                    Err(err) => tracing::error!(error = %err, "failed to reclaim stale jobs"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("stale-claim reclaim loop shutting down");
                    return;
                }
            }
        }
    }
}

const EMBEDDING_DIMENSION: usize = 384;

/// Whether a job that failed with `err` should be requeued for another
/// attempt. Transient transport failures are retried inside the Gateway
/// already (provider.rs) and only surface here after that retry budget is
/// exhausted, so requeuing them at the job level gives a failing call a
/// further chance once conditions change. A schema-validation failure is
/// deterministic — the same input will fail the same way every time — so
/// SPEC_FULL.md §7 fails it terminally instead (see also §4.2).
fn should_requeue(err: &supportbot::Error) -> bool {
    !matches!(err, supportbot::Error::Llm(supportbot::error::LlmError::SchemaValidation { .. }))
}

/// Claim the next job of `kind`, if any, and decode its payload. Returns
/// `None` when the queue has nothing ready.
async fn claim_message_job(
    queue: &JobQueue,
    kind: JobKind,
) -> supportbot::Result<Option<(String, supportbot::domain::MessageJobPayload)>> {
    let Some(job) = queue.claim_next(&[kind]).await? else {
        return Ok(None);
    };

    match serde_json::from_value(job.payload.clone()) {
        Ok(payload) => Ok(Some((job.job_id, payload))),
        Err(err) => {
            tracing::error!(job_id = %job.job_id, error = %err, "invalid job payload, failing terminally");
            queue.fail(&job.job_id, false).await?;
            Ok(None)
        }
    }
}

/// Run a claimed job's `process` future against its total deadline
/// (SPEC_FULL.md §5: "a job that exceeds its total deadline is failed with
/// reason deadline_exceeded"). On timeout the job is failed terminally here
/// (not requeued) and `Ok(())` is returned so the caller does not fail it a
/// second time; an ordinary processing error is passed through unchanged for
/// the caller's own requeue policy.
async fn run_with_job_deadline<F>(
    queue: &JobQueue,
    job_id: &str,
    job_total_deadline: std::time::Duration,
    fut: F,
) -> supportbot::Result<()>
where
    F: std::future::Future<Output = supportbot::Result<()>>,
{
    match tokio::time::timeout(job_total_deadline, fut).await {
        Ok(result) => result,
        Err(_elapsed) => {
            let reason = supportbot::error::QueueError::DeadlineExceeded(job_id.to_string());
            tracing::error!(job_id, %reason, "job exceeded its total deadline, failing terminally");
            let _ = queue.fail(job_id, false).await;
            Ok(())
        }
    }
}

async fn run_buffer_update_loop(
    queue: JobQueue,
    worker: BufferUpdateWorker,
    interval: std::time::Duration,
    job_total_deadline: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match claim_message_job(&queue, JobKind::BufferUpdate).await {
                    Ok(Some((job_id, payload))) => {
                        if let Err(err) =
                            run_with_job_deadline(&queue, &job_id, job_total_deadline, worker.process(&job_id, &payload)).await
                        {
                            let requeue = should_requeue(&err);
                            tracing::error!(job_id = %job_id, error = %err, requeue, "BUFFER_UPDATE job failed");
                            let _ = queue.fail(&job_id, requeue).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::error!(error = %err, "failed to claim BUFFER_UPDATE job"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("BUFFER_UPDATE worker loop shutting down");
                    return;
                }
            }
        }
    }
}

async fn run_maybe_respond_loop(
    queue: JobQueue,
    worker: MaybeRespondWorker,
    interval: std::time::Duration,
    job_total_deadline: std::time::Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match claim_message_job(&queue, JobKind::MaybeRespond).await {
                    Ok(Some((job_id, payload))) => {
                        if let Err(err) =
                            run_with_job_deadline(&queue, &job_id, job_total_deadline, worker.process(&job_id, &payload)).await
                        {
                            let requeue = should_requeue(&err);
                            tracing::error!(job_id = %job_id, error = %err, requeue, "MAYBE_RESPOND job failed");
                            let _ = queue.fail(&job_id, requeue).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::error!(error = %err, "failed to claim MAYBE_RESPOND job"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("MAYBE_RESPOND worker loop shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supportbot::error::LlmError;

    #[test]
    fn schema_validation_failures_are_not_requeued() {
        let err = supportbot::Error::Llm(LlmError::SchemaValidation {
            task: "extract",
            reason: "bad spans".to_string(),
        });
        assert!(!should_requeue(&err));
    }

    #[test]
    fn other_errors_are_requeued() {
        let err = supportbot::Error::Llm(LlmError::ProviderRequest("timed out".to_string()));
        assert!(should_requeue(&err));
    }
}
