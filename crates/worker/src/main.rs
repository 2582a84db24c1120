use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use coachq_ai::OpenAiCompatibleGenerator;
use coachq_infra::config::CoachConfig;
use coachq_infra::context::PostgresContextProvider;
use coachq_infra::jobs::{Executor, PostgresJobStore, Worker};
use coachq_infra::notify::TelegramNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coachq_observability::init();

    let config = CoachConfig::load().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool.clone());
    store.migrate().await.context("failed to migrate job tables")?;
    let context = PostgresContextProvider::new(pool);
    context.migrate().await.context("failed to migrate context tables")?;

    let generator = OpenAiCompatibleGenerator::new(config.generation.clone());
    let mut executor = Executor::new(
        Arc::new(store),
        Arc::new(context),
        Arc::new(generator),
        config.retry_policy(),
        config.executor_settings(),
    );

    match config.notifier.telegram_bot_token.as_deref().map(str::trim) {
        Some(token) if !token.is_empty() => {
            executor = executor.with_notifier(Arc::new(TelegramNotifier::new(token)));
        }
        _ => tracing::warn!("COACHQ_TELEGRAM_BOT_TOKEN not set; notifications disabled"),
    }

    if !executor.is_ready() {
        tracing::warn!("generation API key not set; worker will idle until configured");
    }

    let settings = config.worker_settings();
    tracing::info!(
        worker = %settings.name,
        interval_ms = config.worker.interval_ms,
        batch_size = settings.batch_size,
        "starting coach worker"
    );
    let handle = Worker::new(Arc::new(executor), config.lease_terms(), settings).spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        ticks = stats.ticks,
        jobs_processed = stats.jobs_processed,
        jobs_succeeded = stats.jobs_succeeded,
        jobs_failed = stats.jobs_failed,
        "coach worker stopped"
    );
    Ok(())
}
