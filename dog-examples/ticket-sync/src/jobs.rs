//! Ticket portal jobs: a periodic sync that fans out one download per ticket.

use async_trait::async_trait;
use dog_jobs::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Lists tickets on a portal and enqueues a download for each
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTickets {
    pub portal: String,
}

#[derive(Clone)]
pub struct SyncContext {
    pub queue: WeakPersistentQueue,
    pub tickets_per_sync: u32,
}

#[async_trait]
impl Job for SyncTickets {
    type Context = SyncContext;
    type Output = u32;

    const JOB_TYPE: &'static str = "sync_tickets";

    async fn execute(&self, meta: &JobMeta, ctx: Self::Context) -> Result<Self::Output, JobError> {
        let Some(queue) = ctx.queue.upgrade() else {
            return Err(JobError::permanent("ticket queue has shut down"));
        };

        let mut enqueued = 0;
        for n in 1..=ctx.tickets_per_sync {
            let download = DownloadTicket {
                portal: self.portal.clone(),
                ticket_id: format!("{}-{:04}", self.portal, n),
            };
            queue
                .enqueue_job(&download)
                .await
                .map_err(|e| JobError::retryable(format!("failed to enqueue download: {}", e)))?;
            enqueued += 1;
        }

        info!(sync_id = %meta.id, portal = %self.portal, enqueued, "Ticket sync fanned out");
        Ok(enqueued)
    }
}

/// Fetches one ticket, throttled by the shared limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTicket {
    pub portal: String,
    pub ticket_id: String,
}

#[derive(Clone)]
pub struct DownloadContext {
    pub limiter: RateLimiter,
}

#[async_trait]
impl Job for DownloadTicket {
    type Context = DownloadContext;
    type Output = ();

    const JOB_TYPE: &'static str = "download_ticket";
    const MAX_RETRIES: u32 = 4;

    async fn execute(&self, meta: &JobMeta, ctx: Self::Context) -> Result<Self::Output, JobError> {
        ctx.limiter.acquire().await;

        // Simulated portal: tickets ending in 7 are rate limited on the first try
        tokio::time::sleep(Duration::from_millis(50)).await;
        if meta.attempt == 1 && self.ticket_id.ends_with('7') {
            return Err(JobError::retryable(format!("portal returned 429 for {}", self.ticket_id)));
        }

        info!(ticket_id = %self.ticket_id, attempt = meta.attempt, "Ticket downloaded");
        Ok(())
    }
}
