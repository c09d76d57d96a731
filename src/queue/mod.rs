//! Durable job queue between the poller and the broadcaster.
//!
//! At-least-once: a pulled job stays leased to the consumer until it is
//! acked; an un-acked job becomes visible again when its lease runs out.

pub mod libsql_queue;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

pub use libsql_queue::LibSqlQueue;

/// "Deliver message `external_id` of `account_id` into `group_id`."
///
/// Carries ids only; the message itself is re-fetched at delivery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayJob {
    pub account_id: i64,
    pub group_id: i64,
    pub external_id: u32,
    /// Correlation id for logs.
    pub job_id: Uuid,
}

impl RelayJob {
    pub fn new(account_id: i64, group_id: i64, external_id: u32) -> Self {
        Self {
            account_id,
            group_id,
            external_id,
            job_id: Uuid::new_v4(),
        }
    }
}

/// A job handed to a consumer, to be acked after processing.
#[derive(Debug, Clone)]
pub struct PulledJob {
    /// Queue position; acks refer to it.
    pub seq: i64,
    pub job: RelayJob,
    /// 1 on first delivery, higher on redelivery.
    pub deliveries: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job to the stream.
    async fn publish(&self, job: &RelayJob) -> Result<(), QueueError>;

    /// Pull up to `max_batch` jobs, waiting at most `timeout` for any to
    /// appear. An empty vec means there is no pending work.
    async fn fetch(&self, max_batch: usize, timeout: Duration)
    -> Result<Vec<PulledJob>, QueueError>;

    /// Confirm processing; the job is never delivered again.
    async fn ack(&self, job: &PulledJob) -> Result<(), QueueError>;
}
