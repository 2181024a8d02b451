// Chat endpoints: conversation list, paged message history, sends, read
// receipts, conversation creation. Responses parse into wire DTOs and are
// converted to model types; a malformed response is rejected outright
// instead of being coerced into the store.

use log::debug;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::models::{
    Conversation, ConversationKind, Message, MessageKind, MessageReaction, MessageStatus,
    Presence, User,
};

/// Options for a message history fetch. Page 0 with a 50 message limit is
/// what the backend assumes when the parameters are omitted.
#[derive(Debug, Clone, Serialize)]
pub struct MessageQuery {
    pub page: u32,
    pub limit: u32,
}

impl MessageQuery {
    pub fn new() -> Self {
        MessageQuery { page: 0, limit: 50 }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

fn default_status() -> MessageStatus {
    MessageStatus::Sent
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

fn default_presence() -> Presence {
    Presence::Offline
}

fn default_conversation_kind() -> ConversationKind {
    ConversationKind::Direct
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionDto {
    pub emoji: String,
    pub user_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub timestamp: String,
    #[serde(default = "default_status")]
    pub status: MessageStatus,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: MessageKind,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Vec<ReactionDto>,
    pub client_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDto {
    pub id: String,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    #[serde(default = "default_presence")]
    pub status: Presence,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDto {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_conversation_kind")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub participants: Vec<ParticipantDto>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: Option<MessageDto>,
    pub last_message_time: Option<String>,
}

/// Parse an RFC 3339 timestamp from the wire into epoch seconds. Anything
/// unparseable is a schema violation, not a value to guess at.
pub(crate) fn parse_timestamp(value: &str) -> Result<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(value)
        .map_err(|e| ChatError::Schema(format!("bad timestamp '{}': {}", value, e)))?;
    u64::try_from(parsed.timestamp())
        .map_err(|_| ChatError::Schema(format!("timestamp '{}' precedes the epoch", value)))
}

impl ReactionDto {
    fn into_model(self) -> Result<MessageReaction> {
        Ok(MessageReaction {
            timestamp: parse_timestamp(&self.timestamp)?,
            emoji: self.emoji,
            user_id: self.user_id,
        })
    }
}

impl MessageDto {
    pub fn into_model(self) -> Result<Message> {
        let timestamp = parse_timestamp(&self.timestamp)?;
        let reactions = self
            .reactions
            .into_iter()
            .map(ReactionDto::into_model)
            .collect::<Result<Vec<_>>>()?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            timestamp,
            status: self.status,
            kind: self.kind,
            reply_to: self.reply_to,
            reactions,
            client_key: self.client_key,
        })
    }
}

impl ParticipantDto {
    fn into_model(self) -> User {
        User {
            id: self.id,
            username: self.username,
            email: self.email,
            avatar: self.avatar,
            status: self.status,
            last_seen: None,
        }
    }
}

impl ConversationDto {
    pub fn into_model(self) -> Result<Conversation> {
        let created_at = parse_timestamp(&self.created_at)?;
        let updated_at = parse_timestamp(&self.updated_at)?;
        let last_message = match self.last_message {
            Some(dto) => Some(dto.into_model()?),
            None => None,
        };
        let last_message_time = match self.last_message_time {
            Some(value) => Some(parse_timestamp(&value)?),
            None => None,
        };
        Ok(Conversation {
            id: self.id,
            name: self.name,
            kind: self.kind,
            participants: self
                .participants
                .into_iter()
                .map(ParticipantDto::into_model)
                .collect(),
            last_message,
            last_message_time,
            unread_count: self.unread_count,
            archived: self.is_archived,
            created_at,
            updated_at,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    conversation_id: String,
    content: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    client_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    participant_id: String,
}

impl super::HttpApi {
    /// Fetch the full conversation list.
    pub async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        debug!("Fetching conversations");
        let res = self
            .request(Method::GET, "/api/conversations")
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: Vec<ConversationDto> = serde_json::from_str(&body)?;
        parsed.into_iter().map(ConversationDto::into_model).collect()
    }

    /// Fetch one page of message history for a conversation.
    pub async fn fetch_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        debug!(
            "Fetching messages for {} (page {}, limit {})",
            conversation_id, query.page, query.limit
        );
        let path = format!("/api/messages/{}", conversation_id);
        let res = self
            .request(Method::GET, &path)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: Vec<MessageDto> = serde_json::from_str(&body)?;
        parsed.into_iter().map(MessageDto::into_model).collect()
    }

    /// Persist a message and return the authoritative copy the server built
    /// for it.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<String>,
        client_key: &str,
    ) -> Result<Message> {
        debug!("Sending message to {}", conversation_id);
        let res = self
            .request(Method::POST, "/api/messages")
            .json(&SendMessageRequest {
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
                kind,
                reply_to,
                client_key: client_key.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: MessageDto = serde_json::from_str(&body)?;
        parsed.into_model()
    }

    /// Persist the read state for a conversation.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let path = format!("/api/conversations/{}/read", conversation_id);
        self.request(Method::PATCH, &path)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Start a direct conversation with another user.
    pub async fn create_conversation(&self, participant_id: &str) -> Result<Conversation> {
        debug!("Creating conversation with {}", participant_id);
        let res = self
            .request(Method::POST, "/api/conversations")
            .json(&CreateConversationRequest {
                participant_id: participant_id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: ConversationDto = serde_json::from_str(&body)?;
        parsed.into_model()
    }
}
