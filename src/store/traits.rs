//! `Database` trait: single async interface for accounts, cursors and
//! conversation threads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::DatabaseError;
use crate::mailbox::{Credentials, Provider};

/// A connected mailbox and where its mail is relayed to.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    /// Platform user who owns the mailbox.
    pub user_id: i64,
    pub provider: Provider,
    pub credentials: Credentials,
    /// Destination group; `None` until the bot has been added to one.
    pub group_id: Option<i64>,
    /// Highest id handed to the queue.
    pub enqueued_watermark: u32,
    /// Highest id the broadcaster has picked up.
    pub delivered_watermark: u32,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Cursor used to decide what is new: the larger watermark.
    pub fn cursor(&self) -> u32 {
        self.enqueued_watermark.max(self.delivered_watermark)
    }
}

/// Input for [`Database::insert_account`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: i64,
    pub provider: Provider,
    pub address: String,
    pub secret: SecretString,
}

/// The two per-account cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Enqueued,
    Delivered,
}

impl Watermark {
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued_watermark",
            Self::Delivered => "delivered_watermark",
        }
    }
}

/// A sender's forum topic inside a destination group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationThread {
    pub group_id: i64,
    /// Lower-cased sender address.
    pub sender_address: String,
    pub thread_id: i64,
    /// Topic title shown in the group.
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic persistence for the relay.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    /// Create an account. A second live account for the same address is
    /// a [`DatabaseError::Constraint`].
    async fn insert_account(&self, account: &NewAccount) -> Result<Account, DatabaseError>;

    /// Live account by id. Deleted accounts are `None`.
    async fn get_account(&self, id: i64) -> Result<Option<Account>, DatabaseError>;

    /// Live accounts that have a destination group, by id.
    async fn list_grouped_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Oldest live account of `user_id` still waiting for a group.
    async fn find_ungrouped_account_by_user(
        &self,
        user_id: i64,
    ) -> Result<Option<Account>, DatabaseError>;

    /// Live account bound to `group_id`.
    async fn find_account_by_group(&self, group_id: i64)
    -> Result<Option<Account>, DatabaseError>;

    /// Bind a live account to a group. Returns whether a row changed.
    async fn set_group(&self, account_id: i64, group_id: i64) -> Result<bool, DatabaseError>;

    /// Soft-delete. Returns whether a live account was deleted.
    async fn delete_account(&self, account_id: i64) -> Result<bool, DatabaseError>;

    /// Move a watermark forward to `candidate`. Never moves it backwards;
    /// returns whether it moved.
    async fn advance_watermark(
        &self,
        account_id: i64,
        watermark: Watermark,
        candidate: u32,
    ) -> Result<bool, DatabaseError>;

    // ── Conversation threads ────────────────────────────────────────

    async fn get_thread(
        &self,
        group_id: i64,
        sender_address: &str,
    ) -> Result<Option<ConversationThread>, DatabaseError>;

    /// Store a mapping unless one exists. Returns whether it was inserted.
    async fn insert_thread_if_absent(
        &self,
        group_id: i64,
        sender_address: &str,
        thread_id: i64,
        label: &str,
    ) -> Result<bool, DatabaseError>;

    /// Drop a mapping whose topic no longer exists.
    async fn delete_thread(&self, group_id: i64, sender_address: &str)
    -> Result<bool, DatabaseError>;
}
