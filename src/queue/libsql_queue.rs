//! [`JobQueue`] on the `relay_jobs` table.
//!
//! A consumer claims jobs by leasing rows under its durable name; ack
//! deletes the row. Expired leases are claimable again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, params};
use tracing::{debug, info, warn};

use super::{JobQueue, PulledJob, RelayJob};
use crate::config::QueueConfig;
use crate::error::QueueError;

/// How often an idle fetch re-checks the table.
const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct LibSqlQueue {
    conn: Connection,
    config: QueueConfig,
}

impl LibSqlQueue {
    /// The connection must belong to a database migrated by
    /// [`crate::store::LibSqlBackend`].
    pub fn new(conn: Connection, config: QueueConfig) -> Self {
        Self { conn, config }
    }

    /// Jobs not yet acked, leased or not.
    pub async fn pending(&self) -> Result<u64, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM relay_jobs WHERE subject = ?1",
                params![self.config.subject.as_str()],
            )
            .await
            .map_err(|e| QueueError::Fetch(format!("pending: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map(|n| n.max(0) as u64).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(QueueError::Fetch(format!("pending: {e}"))),
        }
    }

    /// Lease up to `max_batch` claimable jobs in one statement.
    async fn claim(&self, max_batch: usize) -> Result<Vec<PulledJob>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let lease_ms = i64::try_from(self.config.lease.as_millis()).unwrap_or(i64::MAX);
        let leased_until = now.saturating_add(lease_ms);

        let mut rows = self
            .conn
            .query(
                "UPDATE relay_jobs SET lease_owner = ?1, leased_until = ?2, deliveries = deliveries + 1 \
                 WHERE seq IN (SELECT seq FROM relay_jobs WHERE subject = ?3 AND leased_until <= ?4 ORDER BY seq LIMIT ?5) \
                 RETURNING seq, payload, deliveries",
                params![
                    self.config.durable.as_str(),
                    leased_until,
                    self.config.subject.as_str(),
                    now,
                    max_batch as i64,
                ],
            )
            .await
            .map_err(|e| QueueError::Fetch(format!("claim: {e}")))?;

        let mut claimed = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| QueueError::Fetch(format!("claim: {e}")))?
        {
            let seq: i64 = row
                .get(0)
                .map_err(|e| QueueError::Fetch(format!("claim row: {e}")))?;
            let payload: String = row
                .get(1)
                .map_err(|e| QueueError::Fetch(format!("claim row: {e}")))?;
            let deliveries: i64 = row.get(2).unwrap_or(1);
            claimed.push((seq, payload, deliveries));
        }
        drop(rows);
        claimed.sort_by_key(|(seq, _, _)| *seq);

        let mut jobs = Vec::with_capacity(claimed.len());
        for (seq, payload, deliveries) in claimed {
            match serde_json::from_str::<RelayJob>(&payload) {
                Ok(job) => {
                    let deliveries = u32::try_from(deliveries).unwrap_or(u32::MAX);
                    if deliveries > 1 {
                        info!(seq, job_id = %job.job_id, deliveries, "Redelivering relay job");
                    }
                    jobs.push(PulledJob {
                        seq,
                        job,
                        deliveries,
                    });
                }
                Err(e) => {
                    warn!(seq, error = %e, "Dropping undecodable relay job");
                    self.delete(seq).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn delete(&self, seq: i64) -> Result<u64, QueueError> {
        self.conn
            .execute("DELETE FROM relay_jobs WHERE seq = ?1", params![seq])
            .await
            .map_err(|e| QueueError::Ack(format!("delete: {e}")))
    }
}

#[async_trait]
impl JobQueue for LibSqlQueue {
    async fn publish(&self, job: &RelayJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        self.conn
            .execute(
                "INSERT INTO relay_jobs (subject, payload, created_at) VALUES (?1, ?2, ?3)",
                params![
                    self.config.subject.as_str(),
                    payload,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| QueueError::Publish(format!("{e}")))?;

        debug!(
            subject = %self.config.subject,
            account_id = job.account_id,
            external_id = job.external_id,
            job_id = %job.job_id,
            "Relay job published"
        );
        Ok(())
    }

    async fn fetch(
        &self,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<PulledJob>, QueueError> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let jobs = self.claim(max_batch).await?;
            if !jobs.is_empty() {
                return Ok(jobs);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(FETCH_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, job: &PulledJob) -> Result<(), QueueError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM relay_jobs WHERE seq = ?1 AND lease_owner = ?2",
                params![job.seq, self.config.durable.as_str()],
            )
            .await
            .map_err(|e| QueueError::Ack(format!("{e}")))?;

        if deleted == 0 {
            debug!(seq = job.seq, job_id = %job.job.job_id, "Ack for a job that is already gone");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn test_queue(lease: Duration) -> (LibSqlBackend, LibSqlQueue) {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let queue = LibSqlQueue::new(
            backend.connection(),
            QueueConfig {
                lease,
                ..QueueConfig::default()
            },
        );
        (backend, queue)
    }

    #[tokio::test]
    async fn empty_fetch_returns_after_timeout() {
        let (_db, queue) = test_queue(Duration::from_secs(60)).await;
        let started = std::time::Instant::now();
        let jobs = queue.fetch(10, Duration::from_millis(150)).await.unwrap();
        assert!(jobs.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fetch_returns_jobs_in_publish_order() {
        let (_db, queue) = test_queue(Duration::from_secs(60)).await;
        for id in [5, 6, 7] {
            queue.publish(&RelayJob::new(1, -10, id)).await.unwrap();
        }
        let jobs = queue.fetch(10, Duration::from_millis(10)).await.unwrap();
        let ids: Vec<u32> = jobs.iter().map(|j| j.job.external_id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
        assert!(jobs.iter().all(|j| j.deliveries == 1));
    }

    #[tokio::test]
    async fn fetch_respects_batch_size() {
        let (_db, queue) = test_queue(Duration::from_secs(60)).await;
        for id in 1..=5 {
            queue.publish(&RelayJob::new(1, -10, id)).await.unwrap();
        }
        let first = queue.fetch(2, Duration::from_millis(10)).await.unwrap();
        let second = queue.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].job.external_id, 3);
    }

    #[tokio::test]
    async fn leased_jobs_are_not_handed_out_twice() {
        let (_db, queue) = test_queue(Duration::from_secs(60)).await;
        queue.publish(&RelayJob::new(1, -10, 1)).await.unwrap();
        assert_eq!(queue.fetch(10, Duration::from_millis(10)).await.unwrap().len(), 1);
        assert!(queue.fetch(10, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unacked_job_reappears_after_lease() {
        let (_db, queue) = test_queue(Duration::from_millis(50)).await;
        queue.publish(&RelayJob::new(1, -10, 9)).await.unwrap();

        let first = queue.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = queue.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].job, first[0].job);
        assert_eq!(again[0].deliveries, 2);
    }

    #[tokio::test]
    async fn acked_job_never_reappears() {
        let (_db, queue) = test_queue(Duration::from_millis(50)).await;
        queue.publish(&RelayJob::new(1, -10, 9)).await.unwrap();

        let jobs = queue.fetch(10, Duration::from_millis(10)).await.unwrap();
        queue.ack(&jobs[0]).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.fetch(10, Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn double_ack_is_harmless() {
        let (_db, queue) = test_queue(Duration::from_secs(60)).await;
        queue.publish(&RelayJob::new(1, -10, 1)).await.unwrap();
        let jobs = queue.fetch(1, Duration::from_millis(10)).await.unwrap();
        queue.ack(&jobs[0]).await.unwrap();
        queue.ack(&jobs[0]).await.unwrap();
    }

    #[tokio::test]
    async fn poison_payload_is_dropped() {
        let (db, queue) = test_queue(Duration::from_secs(60)).await;
        db.connection()
            .execute(
                "INSERT INTO relay_jobs (subject, payload, created_at) VALUES ('mail.incoming', 'not json', '2026-01-01')",
                (),
            )
            .await
            .unwrap();
        queue.publish(&RelayJob::new(1, -10, 2)).await.unwrap();

        let jobs = queue.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.external_id, 2);
        queue.ack(&jobs[0]).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn jobs_survive_a_new_queue_handle() {
        let (db, queue) = test_queue(Duration::from_secs(60)).await;
        queue.publish(&RelayJob::new(4, -10, 3)).await.unwrap();
        drop(queue);

        let reopened = LibSqlQueue::new(db.connection(), QueueConfig::default());
        let jobs = reopened.fetch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.account_id, 4);
    }
}
