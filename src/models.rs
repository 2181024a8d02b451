use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    pub status: Presence,
    pub last_seen: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
    Away,
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: u64,
    pub status: MessageStatus,
    pub kind: MessageKind,
    pub reply_to: Option<String>,
    pub reactions: Vec<MessageReaction>,
    // Idempotency token set on locally-originated sends; the server echoes
    // it back so a push duplicate can be recognized even before the id swap.
    pub client_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageReaction {
    pub emoji: String,
    pub user_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Voice,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending = 0,   // Optimistic local insert, not yet confirmed
    Sent = 1,      // Accepted by the server
    Delivered = 2, // Delivered to the recipient's device
    Read = 3,      // Read by the recipient
    Failed = 4,    // Send failed; terminal until the user resends
}

impl MessageStatus {
    /// Whether a transition from `self` to `next` is allowed. Status only
    /// moves forward; `Failed` is reachable from `Sending` alone and is
    /// terminal once entered.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Sending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (MessageStatus::Failed, _) => false,
            (cur, next) => (next as u8) > (cur as u8),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub kind: ConversationKind,
    pub participants: Vec<User>,
    pub last_message: Option<Message>,
    pub last_message_time: Option<u64>,
    pub unread_count: u32,
    pub archived: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}
