mod jobs;

use anyhow::Result;
use dog_jobs::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobs::{DownloadContext, DownloadTicket, SyncContext, SyncTickets};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://ticket-sync.db".to_string());
    let portal = std::env::var("TICKET_PORTAL").unwrap_or_else(|_| "north".to_string());
    let tickets_per_sync = std::env::var("TICKETS_PER_SYNC")
        .unwrap_or_else(|_| "20".to_string())
        .parse()
        .unwrap_or(20);

    let store = SqliteStore::connect(&database_url).await?;
    let queue = PersistentQueue::new(store, QueueConfig::from_env().with_name("ticket-sync"))?;
    let limiter = RateLimiter::from_env()?;

    queue.register_job::<SyncTickets>(SyncContext {
        queue: queue.downgrade(),
        tickets_per_sync,
    });
    queue.register_job::<DownloadTicket>(DownloadContext {
        limiter: limiter.clone(),
    });

    let recovered = queue.start().await?;
    info!(recovered, database_url = %database_url, "Ticket sync worker running");

    let mut payload = Payload::new();
    payload.insert("portal".to_string(), portal.into());
    let scheduler = JobScheduler::new(
        std::sync::Arc::new(queue.clone()),
        SyncTickets::JOB_TYPE,
        SchedulerConfig::from_env().with_name("ticket-sync").with_payload(payload),
    )?;
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    scheduler.stop();
    queue.stop();
    queue.wait_for_idle().await;
    limiter.stop();

    let metrics = queue.metrics().await?;
    info!(
        completed = metrics.completed,
        retried = metrics.retried,
        failed = metrics.failed,
        pending = metrics.pending,
        "Shutdown complete"
    );

    Ok(())
}
