//! Mail relay: mirrors IMAP inboxes into Telegram forum topics.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod platform;
pub mod queue;
pub mod relay;
pub mod store;

pub use error::{Error, Result};
