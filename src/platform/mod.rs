//! Chat platform seam: forum topics, text messages and files.

pub mod telegram;

use std::path::Path;

use async_trait::async_trait;

use crate::error::PlatformError;

pub use telegram::TelegramClient;

/// Longest text a single platform message may carry, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Outbound operations the relay needs from a chat platform.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Create a discussion thread (forum topic) and return its id.
    async fn create_thread(&self, group_id: i64, name: &str) -> Result<i64, PlatformError>;

    /// Post text into a thread, returning the new message id.
    async fn send_text(&self, group_id: i64, thread_id: i64, text: &str)
    -> Result<i64, PlatformError>;

    /// Upload a file into a thread, optionally as a reply.
    async fn send_file(
        &self,
        group_id: i64,
        thread_id: i64,
        path: &Path,
        reply_to: Option<i64>,
    ) -> Result<i64, PlatformError>;
}
