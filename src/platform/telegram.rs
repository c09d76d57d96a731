//! Telegram Bot API client.
//!
//! Plain JSON calls for text and topics, multipart for documents. Every
//! response goes through [`into_result`], which turns the Bot API error
//! envelope into a typed [`PlatformError`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::ChatPlatform;
use crate::config::TelegramConfig;
use crate::error::PlatformError;

/// Telegram caps forum topic names at 128 characters.
const MAX_TOPIC_NAME_LENGTH: usize = 128;

/// Seconds `getUpdates` may hold the connection open.
pub const LONG_POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramClient {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

// ── Bot API envelope and objects ────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub is_forum: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMember {
    pub user: User,
    /// creator, administrator, member, restricted, left or kicked.
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    pub from: User,
    pub new_chat_member: ChatMember,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub my_chat_member: Option<ChatMemberUpdated>,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, PlatformError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| PlatformError::Http(format!("{method}: {}", e.without_url())))?;
        Self::read_response(method, resp).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> Result<T, PlatformError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| PlatformError::Http(format!("{method}: {}", e.without_url())))?;
        Self::read_response(method, resp).await
    }

    async fn read_response<T: DeserializeOwned>(
        method: &str,
        resp: reqwest::Response,
    ) -> Result<T, PlatformError> {
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| PlatformError::Http(format!("{method}: {}", e.without_url())))?;
        let envelope: ApiResponse<T> = serde_json::from_str(&text).map_err(|e| PlatformError::Api {
            code: status,
            description: format!("{method}: unreadable response: {e}"),
        })?;
        into_result(status, envelope)
    }

    /// Long-poll for `my_chat_member` updates after `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, PlatformError> {
        self.call(
            "getUpdates",
            &serde_json::json!({
                "offset": offset,
                "timeout": LONG_POLL_TIMEOUT_SECS,
                "allowed_updates": ["my_chat_member"],
            }),
        )
        .await
    }

    pub async fn get_chat_administrators(
        &self,
        chat_id: i64,
    ) -> Result<Vec<ChatMember>, PlatformError> {
        self.call(
            "getChatAdministrators",
            &serde_json::json!({ "chat_id": chat_id }),
        )
        .await
    }
}

#[async_trait]
impl ChatPlatform for TelegramClient {
    async fn create_thread(&self, group_id: i64, name: &str) -> Result<i64, PlatformError> {
        let name: String = name.chars().take(MAX_TOPIC_NAME_LENGTH).collect();
        let topic: ForumTopic = self
            .call(
                "createForumTopic",
                &serde_json::json!({ "chat_id": group_id, "name": name }),
            )
            .await?;
        debug!(group_id, thread_id = topic.message_thread_id, "Forum topic created");
        Ok(topic.message_thread_id)
    }

    async fn send_text(
        &self,
        group_id: i64,
        thread_id: i64,
        text: &str,
    ) -> Result<i64, PlatformError> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                &serde_json::json!({
                    "chat_id": group_id,
                    "message_thread_id": thread_id,
                    "text": text,
                }),
            )
            .await?;
        Ok(sent.message_id)
    }

    async fn send_file(
        &self,
        group_id: i64,
        thread_id: i64,
        path: &Path,
        reply_to: Option<i64>,
    ) -> Result<i64, PlatformError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let file_bytes = tokio::fs::read(path).await?;
        let part = Part::bytes(file_bytes).file_name(file_name);

        let mut form = Form::new()
            .text("chat_id", group_id.to_string())
            .text("message_thread_id", thread_id.to_string())
            .part("document", part);
        if let Some(reply_to) = reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }

        let sent: SentMessage = self.call_multipart("sendDocument", form).await?;
        Ok(sent.message_id)
    }
}

/// Unwrap a Bot API envelope.
fn into_result<T>(status: u16, envelope: ApiResponse<T>) -> Result<T, PlatformError> {
    if envelope.ok
        && let Some(result) = envelope.result
    {
        return Ok(result);
    }
    let code = envelope.error_code.unwrap_or(status);
    let description = envelope
        .description
        .unwrap_or_else(|| "no description".to_string());
    let retry_after = envelope.parameters.and_then(|p| p.retry_after);
    Err(classify_error(code, description, retry_after))
}

/// Map a Bot API error code to the relay's error taxonomy.
pub fn classify_error(code: u16, description: String, retry_after: Option<u64>) -> PlatformError {
    match code {
        429 => PlatformError::RateLimited {
            retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
        },
        403 => PlatformError::Forbidden(description),
        400 if description.to_ascii_lowercase().contains("thread not found") => {
            PlatformError::ThreadNotFound(description)
        }
        400 => PlatformError::BadRequest(description),
        _ => PlatformError::Api { code, description },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TelegramClient {
        TelegramClient::new(&TelegramConfig {
            bot_token: SecretString::from("123:ABC".to_string()),
            api_base: "https://api.telegram.org/".to_string(),
        })
    }

    fn parse<T: DeserializeOwned>(status: u16, body: &str) -> Result<T, PlatformError> {
        into_result(status, serde_json::from_str(body).unwrap())
    }

    #[test]
    fn api_url_includes_token_and_method() {
        assert_eq!(
            client().api_url("sendMessage"),
            "https://api.telegram.org/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn ok_response_yields_result() {
        let sent: SentMessage =
            parse(200, r#"{"ok":true,"result":{"message_id":77,"date":0}}"#).unwrap();
        assert_eq!(sent.message_id, 77);
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = parse::<SentMessage>(
            429,
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 3","parameters":{"retry_after":3}}"#,
        )
        .unwrap_err();
        match err {
            PlatformError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn forbidden_is_permanent() {
        let err = parse::<SentMessage>(
            403,
            r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was kicked from the supergroup chat"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::Forbidden(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn missing_thread_is_distinguished() {
        let err = parse::<SentMessage>(
            400,
            r#"{"ok":false,"error_code":400,"description":"Bad Request: message thread not found"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::ThreadNotFound(_)));
    }

    #[test]
    fn other_bad_request() {
        let err = parse::<SentMessage>(
            400,
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::BadRequest(_)));
    }

    #[test]
    fn unknown_code_is_api_error() {
        let err = parse::<SentMessage>(
            502,
            r#"{"ok":false,"error_code":502,"description":"Bad Gateway"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlatformError::Api { code: 502, .. }));
        assert!(!err.is_permanent());
    }

    #[test]
    fn error_code_falls_back_to_http_status() {
        let err = parse::<SentMessage>(403, r#"{"ok":false}"#).unwrap_err();
        assert!(matches!(err, PlatformError::Forbidden(_)));
    }

    #[test]
    fn my_chat_member_update_deserializes() {
        let updates: Vec<Update> = parse(
            200,
            r#"{"ok":true,"result":[{"update_id":10,"my_chat_member":{
                "chat":{"id":-1001,"type":"supergroup","title":"Mail","is_forum":true},
                "from":{"id":5,"is_bot":false,"first_name":"Ann"},
                "date":0,
                "old_chat_member":{"user":{"id":99,"is_bot":true},"status":"member"},
                "new_chat_member":{"user":{"id":99,"is_bot":true},"status":"administrator"}
            }},{"update_id":11}]}"#,
        )
        .unwrap();
        assert_eq!(updates.len(), 2);
        let change = updates[0].my_chat_member.as_ref().unwrap();
        assert!(change.chat.is_forum);
        assert_eq!(change.chat.kind, "supergroup");
        assert_eq!(change.new_chat_member.status, "administrator");
        assert!(updates[1].my_chat_member.is_none());
    }
}
