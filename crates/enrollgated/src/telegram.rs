//! Minimal Telegram Bot API client: long-poll for text messages, send replies.

use std::time::Duration;

use async_trait::async_trait;
use enrollgate_core::{CallerId, ReplyError, ReplySink};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Telegram API error {code}: {description}")]
    Api { code: i32, description: String },
}

/// Telegram API response wrapper.
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i32>,
}

impl<T> TelegramResponse<T> {
    fn into_result(self) -> Result<T, TelegramError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(TelegramError::Api {
                code: 0,
                description: "Empty result".into(),
            }),
            (false, _) => Err(TelegramError::Api {
                code: self.error_code.unwrap_or(0),
                description: self.description.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: &'static [&'static str],
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
}

impl Update {
    /// Caller and text of a plain text message. Commands (`/start` etc.) and
    /// non-text updates yield `None`.
    pub fn inbound_text(&self) -> Option<(CallerId, &str)> {
        let message = self.message.as_ref()?;
        let text = message.text.as_deref()?;
        if text.trim_start().starts_with('/') {
            return None;
        }
        Some((message.chat.id, text))
    }
}

/// Telegram Bot API client.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    token: String,
    client: Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Result<Self, TelegramError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            token: token.into(),
            client,
            base_url: "https://api.telegram.org".into(),
        })
    }

    /// Point the client at a local stub server, bypassing any system proxy.
    #[cfg(test)]
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self.client = Client::builder()
            .no_proxy()
            .build()
            .expect("plain HTTP client builds");
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    pub async fn get_me(&self) -> Result<BotInfo, TelegramError> {
        self.client
            .get(self.api_url("getMe"))
            .send()
            .await?
            .json::<TelegramResponse<BotInfo>>()
            .await?
            .into_result()
    }

    /// Long-poll for updates after `offset`, waiting up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let request = GetUpdatesRequest {
            offset,
            timeout: timeout_secs,
            allowed_updates: &["message"],
        };
        self.client
            .post(self.api_url("getUpdates"))
            .json(&request)
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await?
            .json::<TelegramResponse<Vec<Update>>>()
            .await?
            .into_result()
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        self.client
            .post(self.api_url("sendMessage"))
            .json(&SendMessageRequest { chat_id, text })
            .send()
            .await?
            .json::<TelegramResponse<serde_json::Value>>()
            .await?
            .into_result()
            .map(|_| ())
    }
}

#[async_trait]
impl ReplySink for TelegramClient {
    async fn send(&self, caller: CallerId, text: &str) -> Result<(), ReplyError> {
        self.send_message(caller, text)
            .await
            .map_err(|e| ReplyError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: serde_json::Value) -> Update {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_text_message() {
        let u = update(serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "date": 1700000000,
                "chat": {"id": -100, "type": "private"},
                "from": {"id": -100, "is_bot": false, "first_name": "A"},
                "text": "alice"
            }
        }));
        assert_eq!(u.inbound_text(), Some((-100, "alice")));
    }

    #[test]
    fn test_commands_and_non_text_are_ignored() {
        let command = update(serde_json::json!({
            "update_id": 11,
            "message": {"message_id": 2, "chat": {"id": 5}, "text": "/start"}
        }));
        assert_eq!(command.inbound_text(), None);

        let photo = update(serde_json::json!({
            "update_id": 12,
            "message": {"message_id": 3, "chat": {"id": 5}, "photo": []}
        }));
        assert_eq!(photo.inbound_text(), None);

        let edited = update(serde_json::json!({
            "update_id": 13,
            "edited_message": {"message_id": 4, "chat": {"id": 5}, "text": "alice"}
        }));
        assert_eq!(edited.inbound_text(), None);
    }

    #[test]
    fn test_response_errors() {
        let err: TelegramResponse<BotInfo> = serde_json::from_value(serde_json::json!({
            "ok": false,
            "error_code": 401,
            "description": "Unauthorized"
        }))
        .unwrap();
        assert!(matches!(
            err.into_result(),
            Err(TelegramError::Api { code: 401, .. })
        ));
    }

    #[test]
    fn test_api_url() {
        let client = TelegramClient::new("123:abc")
            .unwrap()
            .with_base_url("http://localhost:8081");
        assert_eq!(client.api_url("getMe"), "http://localhost:8081/bot123:abc/getMe");
    }
}
