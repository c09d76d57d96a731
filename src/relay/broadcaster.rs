//! Broadcaster: pulls relay jobs, re-fetches each message and delivers
//! it into the sender's thread.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::delivery::{DeliveryEngine, DeliveryReport};
use super::MIN_TICK;
use super::router::TopicRouter;
use crate::config::BroadcasterConfig;
use crate::error::{Error, PlatformError, QueueError};
use crate::mailbox::{AttachmentCache, ExternalMessage, MailboxConnector};
use crate::platform::ChatPlatform;
use crate::queue::{JobQueue, RelayJob};
use crate::store::{Account, Database, Watermark};

/// How one job ended. Every outcome is acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered(DeliveryReport),
    Skipped(String),
    /// `permanent` failures would fail the same way on a retry.
    Failed { reason: String, permanent: bool },
}

/// Totals for one broadcast tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub ack_failures: usize,
}

pub struct Broadcaster {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn MailboxConnector>,
    queue: Arc<dyn JobQueue>,
    router: TopicRouter,
    delivery: DeliveryEngine,
    config: BroadcasterConfig,
    cache_dir: PathBuf,
}

impl Broadcaster {
    pub fn new(
        db: Arc<dyn Database>,
        mailbox: Arc<dyn MailboxConnector>,
        queue: Arc<dyn JobQueue>,
        platform: Arc<dyn ChatPlatform>,
        config: BroadcasterConfig,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            router: TopicRouter::new(Arc::clone(&db), Arc::clone(&platform)),
            delivery: DeliveryEngine::new(platform),
            db,
            mailbox,
            queue,
            config,
            cache_dir,
        }
    }

    /// Pull one batch and process it job by job. Only the pull itself can
    /// fail the tick.
    pub async fn tick(&self) -> Result<BroadcastReport, QueueError> {
        let jobs = self
            .queue
            .fetch(self.config.batch_size, self.config.fetch_timeout)
            .await?;

        let mut report = BroadcastReport::default();
        for pulled in jobs {
            let job = &pulled.job;
            let outcome = self.process(job).await;
            match &outcome {
                JobOutcome::Delivered(delivery) => {
                    report.delivered += 1;
                    info!(
                        account_id = job.account_id,
                        external_id = job.external_id,
                        job_id = %job.job_id,
                        messages = delivery.messages_sent,
                        attachments = delivery.attachments_sent,
                        attachments_failed = delivery.attachments_failed,
                        "Message relayed"
                    );
                }
                JobOutcome::Skipped(reason) => {
                    report.skipped += 1;
                    info!(account_id = job.account_id, external_id = job.external_id, job_id = %job.job_id, reason = %reason, "Relay job skipped");
                }
                JobOutcome::Failed { reason, permanent } => {
                    report.failed += 1;
                    warn!(
                        account_id = job.account_id,
                        external_id = job.external_id,
                        job_id = %job.job_id,
                        deliveries = pulled.deliveries,
                        permanent,
                        reason = %reason,
                        "Relay job failed"
                    );
                }
            }

            if let Err(e) = self.queue.ack(&pulled).await {
                error!(seq = pulled.seq, job_id = %job.job_id, error = %e, "Ack failed; job will be redelivered");
                report.ack_failures += 1;
            }
        }
        Ok(report)
    }

    /// Handle one job end to end. Never fails; errors become
    /// [`JobOutcome::Failed`].
    pub async fn process(&self, job: &RelayJob) -> JobOutcome {
        match self.attempt(job).await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Failed {
                permanent: e.is_permanent(),
                reason: e.to_string(),
            },
        }
    }

    async fn attempt(&self, job: &RelayJob) -> Result<JobOutcome, Error> {
        let Some(account) = self.db.get_account(job.account_id).await? else {
            return Ok(JobOutcome::Skipped("account deleted".into()));
        };
        if account.group_id != Some(job.group_id) {
            return Ok(JobOutcome::Skipped("account moved to another group".into()));
        }

        self.db
            .advance_watermark(account.id, Watermark::Delivered, job.external_id)
            .await?;

        let cache = AttachmentCache::new(&self.cache_dir, account.id);
        let relayed = self.relay(&account, job, &cache).await;
        cache.release().await;
        Ok(JobOutcome::Delivered(relayed?))
    }

    /// Fetch the message into `cache` and deliver it.
    async fn relay(
        &self,
        account: &Account,
        job: &RelayJob,
        cache: &AttachmentCache,
    ) -> Result<DeliveryReport, Error> {
        let mut session = self.mailbox.connect(account).await?;
        let fetched = session.fetch(job.external_id, cache).await;
        session.close().await;
        let message = fetched?;
        self.deliver(job.group_id, &message).await
    }

    /// Route and deliver, recreating the thread once if it was deleted.
    async fn deliver(&self, group_id: i64, message: &ExternalMessage) -> Result<DeliveryReport, Error> {
        let thread_id = self.router.resolve(group_id, &message.sender_address).await?;
        match self.delivery.deliver(group_id, thread_id, message).await {
            Err(PlatformError::ThreadNotFound(reason)) => {
                debug!(group_id, thread_id, reason = %reason, "Thread gone, recreating");
                self.router.forget(group_id, &message.sender_address).await?;
                let thread_id = self.router.resolve(group_id, &message.sender_address).await?;
                Ok(self.delivery.deliver(group_id, thread_id, message).await?)
            }
            other => Ok(other?),
        }
    }
}

/// Run broadcast ticks every `config.interval` until `shutdown` flips to
/// true. A batch in progress always finishes, acks included.
pub fn spawn_broadcaster(
    broadcaster: Arc<Broadcaster>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = broadcaster.config.interval.as_secs(),
            batch_size = broadcaster.config.batch_size,
            "Broadcaster started"
        );
        let mut tick = tokio::time::interval(broadcaster.config.interval.max(MIN_TICK));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown sender dropped, broadcaster exiting");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                info!("Broadcaster shutting down");
                return;
            }

            match broadcaster.tick().await {
                Ok(report) if report == BroadcastReport::default() => {}
                Ok(report) => info!(?report, "Broadcast tick complete"),
                Err(e) => warn!(error = %e, "Queue fetch failed, retrying next tick"),
            }
        }
    })
}
