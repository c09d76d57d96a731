//! Mailbox client: read-only access to a remote IMAP inbox.
//!
//! A session is opened per account and per use: the poller lists ids,
//! the broadcaster fetches one message. Nothing on the server is
//! modified.

pub mod attachments;
pub mod imap;
pub mod parser;
pub mod provider;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::MailboxError;
use crate::store::Account;

pub use attachments::AttachmentCache;
pub use imap::ImapConnector;
pub use provider::Provider;

/// Login credentials for one mailbox.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub address: String,
    pub secret: SecretString,
}

/// Which messages a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFilter {
    All,
}

impl SearchFilter {
    pub fn as_imap(self) -> &'static str {
        match self {
            Self::All => "ALL",
        }
    }
}

/// A message fetched for one delivery attempt.
#[derive(Debug, Clone)]
pub struct ExternalMessage {
    pub id: u32,
    pub sender_name: Option<String>,
    pub sender_address: String,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Normalized text cut into platform-sized segments, in order.
    pub segments: Vec<String>,
    /// Attachment files inside the attempt's [`AttachmentCache`].
    pub attachments: Vec<PathBuf>,
}

/// Opens mailbox sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Connect and authenticate, retrying within the configured budget.
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An authenticated, read-only mailbox session.
#[async_trait]
pub trait MailboxSession: Send {
    /// Ids matching `filter`, ascending.
    async fn list_ids(&mut self, filter: SearchFilter) -> Result<Vec<u32>, MailboxError>;

    /// Fetch and parse one message; attachments are written into `cache`.
    async fn fetch(
        &mut self,
        id: u32,
        cache: &AttachmentCache,
    ) -> Result<ExternalMessage, MailboxError>;

    /// Log out. Errors are swallowed; the session is gone either way.
    async fn close(self: Box<Self>);
}
