//! Binds accounts to destination groups as the bot is promoted in, or
//! removed from, forum groups.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Error};
use crate::platform::telegram::{ChatMember, ChatMemberUpdated, TelegramClient};
use crate::store::Database;

/// Pause after a failed `getUpdates` call.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What the bot's own membership change means for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// Bot became an admin of a forum group owned by `owner_user_id`.
    Promoted { group_id: i64, owner_user_id: i64 },
    /// Bot left or was kicked from the group.
    Removed { group_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOutcome {
    Bound { account_id: i64 },
    AlreadyBound { account_id: i64 },
    /// The group already relays another user's account; nothing changed.
    GroupTaken { account_id: i64 },
    NoPendingAccount,
    Unbound { account_id: i64 },
    NotBound,
}

/// Bot status transition read off a `my_chat_member` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Promoted,
    Removed,
}

pub fn classify(update: &ChatMemberUpdated) -> Option<BotStatus> {
    match update.new_chat_member.status.as_str() {
        "administrator" | "creator" => Some(BotStatus::Promoted),
        "left" | "kicked" => Some(BotStatus::Removed),
        _ => None,
    }
}

/// The human creator of a chat, if the admin list shows one.
pub fn find_owner(admins: &[ChatMember]) -> Option<i64> {
    admins
        .iter()
        .find(|m| m.status == "creator" && !m.user.is_bot)
        .map(|m| m.user.id)
}

/// Apply a membership change to the store.
pub async fn apply(
    db: &dyn Database,
    change: &MembershipChange,
) -> Result<MembershipOutcome, DatabaseError> {
    match *change {
        MembershipChange::Promoted {
            group_id,
            owner_user_id,
        } => {
            if let Some(bound) = db.find_account_by_group(group_id).await? {
                return Ok(if bound.user_id == owner_user_id {
                    MembershipOutcome::AlreadyBound {
                        account_id: bound.id,
                    }
                } else {
                    MembershipOutcome::GroupTaken {
                        account_id: bound.id,
                    }
                });
            }
            let Some(pending) = db.find_ungrouped_account_by_user(owner_user_id).await? else {
                return Ok(MembershipOutcome::NoPendingAccount);
            };
            if db.set_group(pending.id, group_id).await? {
                Ok(MembershipOutcome::Bound {
                    account_id: pending.id,
                })
            } else {
                Ok(MembershipOutcome::NoPendingAccount)
            }
        }
        MembershipChange::Removed { group_id } => {
            let Some(bound) = db.find_account_by_group(group_id).await? else {
                return Ok(MembershipOutcome::NotBound);
            };
            if db.delete_account(bound.id).await? {
                Ok(MembershipOutcome::Unbound {
                    account_id: bound.id,
                })
            } else {
                Ok(MembershipOutcome::NotBound)
            }
        }
    }
}

pub struct MembershipWatcher {
    client: Arc<TelegramClient>,
    db: Arc<dyn Database>,
}

impl MembershipWatcher {
    pub fn new(client: Arc<TelegramClient>, db: Arc<dyn Database>) -> Self {
        Self { client, db }
    }

    /// Turn one update into a store change. Non-forum promotions and
    /// status changes that are neither promotion nor removal are ignored.
    pub async fn handle(&self, update: &ChatMemberUpdated) -> Result<Option<MembershipOutcome>, Error> {
        let group_id = update.chat.id;
        let change = match classify(update) {
            Some(BotStatus::Promoted) if !update.chat.is_forum => {
                info!(group_id, "Bot promoted in a group without topics, ignoring");
                return Ok(None);
            }
            Some(BotStatus::Promoted) => {
                let admins = self.client.get_chat_administrators(group_id).await?;
                let Some(owner_user_id) = find_owner(&admins) else {
                    warn!(group_id, "Group has no human owner, cannot bind an account");
                    return Ok(None);
                };
                MembershipChange::Promoted {
                    group_id,
                    owner_user_id,
                }
            }
            Some(BotStatus::Removed) => MembershipChange::Removed { group_id },
            None => {
                debug!(group_id, status = %update.new_chat_member.status, "Membership update ignored");
                return Ok(None);
            }
        };

        let outcome = apply(self.db.as_ref(), &change).await?;
        match outcome {
            MembershipOutcome::GroupTaken { account_id } => {
                warn!(group_id, account_id, "Group already relays another user's mailbox, not rebinding");
            }
            _ => info!(?change, ?outcome, "Group membership applied"),
        }
        Ok(Some(outcome))
    }
}

/// Long-poll bot membership updates until `shutdown` flips to true.
pub fn spawn_membership_watcher(
    watcher: Arc<MembershipWatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Membership watcher started");
        let mut offset: i64 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Membership watcher shutting down");
                return;
            }

            let updates = tokio::select! {
                res = watcher.client.get_updates(offset) => res,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(member_update) = update.my_chat_member else {
                    continue;
                };
                if let Err(e) = watcher.handle(&member_update).await {
                    warn!(group_id = member_update.chat.id, error = %e, "Membership update failed");
                }
            }
        }
    })
}
