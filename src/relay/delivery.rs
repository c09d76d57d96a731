//! Sends one message into a thread: text segments, footer, attachments.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PlatformError;
use crate::mailbox::ExternalMessage;
use crate::platform::{ChatPlatform, MAX_MESSAGE_LENGTH};

/// How many rate-limit sleeps a single send may absorb.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// What a delivery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub messages_sent: usize,
    pub attachments_sent: usize,
    pub attachments_failed: usize,
    /// Rate-limit sleeps taken across all sends.
    pub rate_limited: u32,
}

pub struct DeliveryEngine {
    platform: Arc<dyn ChatPlatform>,
}

impl DeliveryEngine {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self { platform }
    }

    /// Post `message` into `thread_id`.
    ///
    /// A failed text send stops the delivery and is returned; failed
    /// attachments are counted and skipped.
    pub async fn deliver(
        &self,
        group_id: i64,
        thread_id: i64,
        message: &ExternalMessage,
    ) -> Result<DeliveryReport, PlatformError> {
        let mut report = DeliveryReport::default();
        let mut first_message_id = None;

        for text in compose_texts(message) {
            let (result, waits) =
                with_rate_limit(|| self.platform.send_text(group_id, thread_id, &text)).await;
            report.rate_limited += waits;
            let message_id = result?;
            first_message_id.get_or_insert(message_id);
            report.messages_sent += 1;
        }

        for path in &message.attachments {
            let (result, waits) = with_rate_limit(|| {
                self.platform
                    .send_file(group_id, thread_id, path, first_message_id)
            })
            .await;
            report.rate_limited += waits;
            match result {
                Ok(_) => report.attachments_sent += 1,
                Err(e) => {
                    warn!(
                        external_id = message.id,
                        path = %path.display(),
                        error = %e,
                        "Attachment send failed"
                    );
                    report.attachments_failed += 1;
                }
            }
        }

        debug!(external_id = message.id, ?report, "Message delivered");
        Ok(report)
    }
}

/// Run `send`, sleeping through rate limits up to
/// [`MAX_RATE_LIMIT_RETRIES`] times. Returns the result and the number
/// of sleeps taken.
async fn with_rate_limit<F, Fut>(mut send: F) -> (Result<i64, PlatformError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<i64, PlatformError>>,
{
    let mut waits = 0;
    loop {
        match send().await {
            Err(PlatformError::RateLimited { retry_after }) if waits < MAX_RATE_LIMIT_RETRIES => {
                waits += 1;
                warn!(retry_after_secs = retry_after.as_secs(), attempt = waits, "Rate limited, waiting");
                tokio::time::sleep(retry_after).await;
            }
            other => return (other, waits),
        }
    }
}

/// The texts to send, in order. The footer rides on the last segment
/// when it fits; a message without text gets the footer alone.
pub fn compose_texts(message: &ExternalMessage) -> Vec<String> {
    let footer = footer(message);
    let mut texts = message.segments.clone();
    match texts.last_mut() {
        None => texts.push(footer),
        Some(last) => {
            let combined_len = last.chars().count() + 2 + footer.chars().count();
            if combined_len <= MAX_MESSAGE_LENGTH {
                last.push_str("\n\n");
                last.push_str(&footer);
            } else {
                texts.push(footer);
            }
        }
    }
    texts
}

fn footer(message: &ExternalMessage) -> String {
    let from = match message.sender_name.as_deref().filter(|n| !n.trim().is_empty()) {
        Some(name) => format!("{name} <{}>", message.sender_address),
        None => message.sender_address.clone(),
    };
    let subject = message.subject.as_deref().unwrap_or("(no subject)");
    let date = message
        .date
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("From: {from}\nSubject: {subject}\nDate: {date}")
}
