//! Maps (group, sender) to a forum topic, creating topics on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Error};
use crate::platform::ChatPlatform;
use crate::store::Database;

type LockKey = (i64, String);

pub struct TopicRouter {
    db: Arc<dyn Database>,
    platform: Arc<dyn ChatPlatform>,
    /// One async lock per key with a creation in flight.
    creating: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TopicRouter {
    pub fn new(db: Arc<dyn Database>, platform: Arc<dyn ChatPlatform>) -> Self {
        Self {
            db,
            platform,
            creating: Mutex::new(HashMap::new()),
        }
    }

    /// Thread id for `sender_address` in `group_id`, creating the topic
    /// if the sender has none yet.
    pub async fn resolve(&self, group_id: i64, sender_address: &str) -> Result<i64, Error> {
        let sender = sender_address.trim().to_lowercase();
        if let Some(thread) = self.db.get_thread(group_id, &sender).await? {
            return Ok(thread.thread_id);
        }

        let key = (group_id, sender.clone());
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(group_id, &sender).await
        };
        drop(lock);
        self.release(&key);
        result
    }

    /// Drop a mapping whose topic was deleted on the platform side.
    pub async fn forget(&self, group_id: i64, sender_address: &str) -> Result<(), Error> {
        if self.db.delete_thread(group_id, sender_address).await? {
            info!(group_id, sender = %sender_address, "Stale conversation thread forgotten");
        }
        Ok(())
    }

    async fn create_locked(&self, group_id: i64, sender: &str) -> Result<i64, Error> {
        // Another task may have finished creating while we waited.
        if let Some(thread) = self.db.get_thread(group_id, sender).await? {
            return Ok(thread.thread_id);
        }

        match self.platform.create_thread(group_id, sender).await {
            Ok(thread_id) => {
                let inserted = self
                    .db
                    .insert_thread_if_absent(group_id, sender, thread_id, sender)
                    .await?;
                if inserted {
                    info!(group_id, thread_id, sender, "Conversation thread created");
                } else {
                    debug!(group_id, thread_id, sender, "Lost topic creation race, using stored thread");
                }
            }
            Err(e) => {
                if let Some(thread) = self.db.get_thread(group_id, sender).await? {
                    warn!(group_id, sender, error = %e, "Topic creation failed but a thread exists");
                    return Ok(thread.thread_id);
                }
                return Err(e.into());
            }
        }

        self.db
            .get_thread(group_id, sender)
            .await?
            .map(|t| t.thread_id)
            .ok_or_else(|| {
                DatabaseError::NotFound {
                    entity: "conversation_thread".into(),
                    id: format!("{group_id}/{sender}"),
                }
                .into()
            })
    }

    fn lock_for(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(key.clone()).or_default())
    }

    /// Remove the lock once nobody else holds a handle to it.
    fn release(&self, key: &LockKey) {
        let mut map = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(key);
        }
    }
}
