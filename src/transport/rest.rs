// REST side of the transport client.
// `ChatApi` is the seam the synchronizer talks through; `HttpChatApi` is the
// reqwest implementation against the chat backend and user directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::config::TransportConfig;
use crate::error::{ChatError, Result};
use crate::models::{BlockedUser, Conversation, Message};
use crate::transport::wire::{
    blocked_user_from_record, conversation_from_record, display_name_from_record, list_items,
    message_from_record, payload_sources, str_field, timestamp_field, unread_counts_from_body,
};

/// Body of `POST send-message`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub receiver_name: String,
    pub text: String,
}

/// What the backend assigned to a stored message.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One page of history, oldest first. `cursor` is what to pass as
/// `last_message_id` to get the page before this one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>>;

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        last_message_id: Option<&str>,
    ) -> Result<MessagePage>;

    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt>;

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()>;

    /// Unread count per conversation id. Conversations with nothing unread
    /// may be absent.
    async fn unread_counts(&self, user_id: &str) -> Result<HashMap<String, u32>>;

    async fn delete_message(&self, conversation_id: &str, message_id: &str, user_id: &str) -> Result<()>;

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
        new_text: &str,
    ) -> Result<()>;

    async fn block_user(&self, user_id: &str, blocked_user_id: &str) -> Result<()>;

    async fn unblock_user(&self, user_id: &str, blocked_user_id: &str) -> Result<()>;

    async fn blocked_users(&self, user_id: &str) -> Result<Vec<BlockedUser>>;

    /// Display name from the user directory; `None` when the user is unknown.
    async fn lookup_name(&self, user_id: &str) -> Result<Option<String>>;
}

pub struct HttpChatApi {
    http: reqwest::Client,
    api_base: String,
    directory_base: String,
}

impl HttpChatApi {
    pub fn new(config: &TransportConfig) -> Self {
        HttpChatApi {
            http: reqwest::Client::new(),
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            directory_base: config.directory_base().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = self.endpoint(path);
        debug!("GET {} {:?}", url, query);
        let resp = self.http.get(&url).query(query).send().await?;
        read_body(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = self.endpoint(path);
        debug!("POST {}", url);
        let resp = self.http.post(&url).json(&body).send().await?;
        read_body(resp).await
    }
}

/// Non-2xx responses become `ChatError::Request` with the body captured;
/// empty 2xx bodies read as `null`.
async fn read_body(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        warn!("Request failed with {}: {}", status, text);
        return Err(ChatError::Request {
            status: status.as_u16(),
            body: text,
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let body = self.get("conversations", &[("userId", user_id)]).await?;
        Ok(list_items(&body, &["conversations"])
            .into_iter()
            .filter_map(|record| conversation_from_record(record, user_id))
            .collect())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        last_message_id: Option<&str>,
    ) -> Result<MessagePage> {
        let limit = limit.to_string();
        let mut query = vec![("conversationId", conversation_id), ("limit", limit.as_str())];
        if let Some(cursor) = last_message_id {
            query.push(("lastMessageId", cursor));
        }
        let body = self.get("messages", &query).await?;
        Ok(page_from_body(&body, conversation_id))
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt> {
        let body = self.post("send-message", serde_json::to_value(message)?).await?;
        receipt_from_body(&body)
    }

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.post(
            "mark-read",
            json!({ "conversationId": conversation_id, "userId": user_id }),
        )
        .await?;
        Ok(())
    }

    async fn unread_counts(&self, user_id: &str) -> Result<HashMap<String, u32>> {
        let body = self.get("unread-counts", &[("userId", user_id)]).await?;
        Ok(unread_counts_from_body(&body))
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str, user_id: &str) -> Result<()> {
        self.post(
            "delete-message",
            json!({
                "conversationId": conversation_id,
                "messageId": message_id,
                "userId": user_id,
            }),
        )
        .await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        user_id: &str,
        new_text: &str,
    ) -> Result<()> {
        self.post(
            "edit-message",
            json!({
                "conversationId": conversation_id,
                "messageId": message_id,
                "userId": user_id,
                "newText": new_text,
            }),
        )
        .await?;
        Ok(())
    }

    async fn block_user(&self, user_id: &str, blocked_user_id: &str) -> Result<()> {
        self.post(
            "block-user",
            json!({ "userId": user_id, "blockedUserId": blocked_user_id }),
        )
        .await?;
        Ok(())
    }

    async fn unblock_user(&self, user_id: &str, blocked_user_id: &str) -> Result<()> {
        self.post(
            "unblock-user",
            json!({ "userId": user_id, "blockedUserId": blocked_user_id }),
        )
        .await?;
        Ok(())
    }

    async fn blocked_users(&self, user_id: &str) -> Result<Vec<BlockedUser>> {
        let body = self.get("blocked-users", &[("userId", user_id)]).await?;
        Ok(list_items(&body, &["blockedUsers"])
            .into_iter()
            .filter_map(blocked_user_from_record)
            .collect())
    }

    async fn lookup_name(&self, user_id: &str) -> Result<Option<String>> {
        let url = user_url(&self.directory_base, user_id)?;
        let resp = self.http.get(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("No directory entry for {}", user_id);
            return Ok(None);
        }
        let body = read_body(resp).await?;
        Ok(display_name_from_record(&body))
    }
}

/// Directory entry for one user. The id is pushed as a single path segment
/// so reserved characters in it are percent-encoded.
pub fn user_url(directory_base: &str, user_id: &str) -> Result<url::Url> {
    let mut url = url::Url::parse(directory_base)?;
    url.path_segments_mut()
        .map_err(|_| ChatError::validation(format!("{} cannot carry a path", directory_base)))?
        .pop_if_empty()
        .push("users")
        .push(user_id);
    Ok(url)
}

/// History body → ordered page. Metadata records and empty messages are
/// dropped here so callers only ever see real messages.
pub fn page_from_body(body: &Value, conversation_id: &str) -> MessagePage {
    let mut messages: Vec<Message> = list_items(body, &["messages"])
        .into_iter()
        .filter_map(|record| message_from_record(record, conversation_id))
        .collect();
    messages.sort_by_key(|m| m.timestamp);

    let cursor = str_field(&[body], &["lastMessageId", "nextCursor", "cursor"]).or_else(|| {
        body.get("lastEvaluatedKey")
            .or_else(|| body.get("LastEvaluatedKey"))
            .and_then(|key| str_field(&[key], &["SK", "sk", "messageId"]))
    });

    MessagePage { messages, cursor }
}

fn receipt_from_body(body: &Value) -> Result<SendReceipt> {
    let sources = payload_sources(body);
    let message_id = str_field(&sources, &["messageId", "message_id", "id", "SK"])
        .ok_or_else(|| ChatError::Other("send-message response carried no message id".to_string()))?;
    Ok(SendReceipt {
        message_id,
        timestamp: timestamp_field(&sources, &["timestamp", "createdAt", "sentAt"])
            .unwrap_or_else(Utc::now),
    })
}
