//! Mailbox poller: finds new message ids and hands them to the queue.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::MIN_TICK;
use crate::config::PollerConfig;
use crate::error::{DatabaseError, Error, QueueError};
use crate::mailbox::{MailboxConnector, SearchFilter};
use crate::queue::{JobQueue, RelayJob};
use crate::store::{Account, Database, Watermark};

/// Outcome of one poll tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub accounts_polled: usize,
    /// Mailbox could not be reached this tick.
    pub accounts_unavailable: usize,
    /// Listing, publishing or cursor update failed.
    pub accounts_failed: usize,
    pub jobs_published: usize,
}

enum AccountPoll {
    Published(usize),
    Unavailable,
}

pub struct Poller {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn MailboxConnector>,
    queue: Arc<dyn JobQueue>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        db: Arc<dyn Database>,
        mailbox: Arc<dyn MailboxConnector>,
        queue: Arc<dyn JobQueue>,
        config: PollerConfig,
    ) -> Self {
        Self {
            db,
            mailbox,
            queue,
            config,
        }
    }

    /// Poll every grouped account once. Only listing the accounts can
    /// fail the tick; per-account failures are counted and logged.
    pub async fn tick(&self) -> Result<PollReport, DatabaseError> {
        let mut report = PollReport::default();
        for account in self.db.list_grouped_accounts().await? {
            report.accounts_polled += 1;
            match self.poll_account(&account).await {
                Ok(AccountPoll::Published(n)) => report.jobs_published += n,
                Ok(AccountPoll::Unavailable) => report.accounts_unavailable += 1,
                Err(e) => {
                    error!(account_id = account.id, error = %e, "Account poll failed");
                    report.accounts_failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn poll_account(&self, account: &Account) -> Result<AccountPoll, Error> {
        let Some(group_id) = account.group_id else {
            return Ok(AccountPoll::Published(0));
        };

        let mut session = match self.mailbox.connect(account).await {
            Ok(session) => session,
            Err(e) => {
                warn!(account_id = account.id, error = %e, "Mailbox unavailable, skipping this tick");
                return Ok(AccountPoll::Unavailable);
            }
        };
        let listing = session.list_ids(SearchFilter::All).await;
        session.close().await;
        let ids = listing?;

        let cursor = account.cursor();
        let new_ids = select_new_ids(&ids, cursor, self.config.initial_fetch_count);
        if new_ids.is_empty() {
            debug!(account_id = account.id, cursor, "No new messages");
            return Ok(AccountPoll::Published(0));
        }

        let mut last_published = None;
        for &id in &new_ids {
            let job = RelayJob::new(account.id, group_id, id);
            match self.queue.publish(&job).await {
                Ok(()) => last_published = Some(id),
                Err(e) => {
                    warn!(account_id = account.id, external_id = id, error = %e, "Publish failed, retrying next tick");
                    break;
                }
            }
        }

        let Some(last) = last_published else {
            return Err(QueueError::Publish("no job could be published".into()).into());
        };
        self.db
            .advance_watermark(account.id, Watermark::Enqueued, last)
            .await?;

        let published = new_ids.iter().take_while(|&&id| id <= last).count();
        info!(account_id = account.id, published, cursor = last, "Relay jobs enqueued");
        Ok(AccountPoll::Published(published))
    }
}

/// Ids strictly above `cursor`, ascending. A never-polled account
/// (cursor 0) starts with only its `initial_count` most recent ids.
pub fn select_new_ids(ids: &[u32], cursor: u32, initial_count: usize) -> Vec<u32> {
    let mut fresh: Vec<u32> = ids.iter().copied().filter(|&id| id > cursor).collect();
    fresh.sort_unstable();
    fresh.dedup();
    if cursor == 0 && fresh.len() > initial_count {
        fresh.drain(..fresh.len() - initial_count);
    }
    fresh
}

/// Run the poller every `config.interval` until `shutdown` flips to true.
pub fn spawn_poller(poller: Arc<Poller>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = poller.config.interval.as_secs(),
            "Mailbox poller started"
        );
        let mut tick = tokio::time::interval(poller.config.interval.max(MIN_TICK));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown sender dropped, mailbox poller exiting");
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                info!("Mailbox poller shutting down");
                return;
            }

            match poller.tick().await {
                Ok(report) if report.jobs_published > 0 || report.accounts_failed > 0 => {
                    info!(?report, "Poll tick complete");
                }
                Ok(report) => debug!(?report, "Poll tick complete"),
                Err(e) => error!(error = %e, "Poll tick failed to list accounts"),
            }
        }
    })
}
