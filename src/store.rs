// Synchronization store
// Single source of truth for conversations, messages, typing and presence.
// ChatState is the synchronous reducer; ChatStore is the async handle that
// feeds it from the REST API and the realtime channel and arbitrates
// between optimistic local writes and authoritative remote confirmations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use crate::api::{ChatApi, MessageQuery};
use crate::channel::{
    parse_frame, ChannelEvent, ConnectionState, RealtimeChannel, SocketTransport,
};
use crate::credentials;
use crate::models::{Conversation, Message, MessageKind, MessageStatus, Presence, User};

/// Owned copy of the store state handed to the view layer for rendering.
/// Conversations come sorted by most recent activity; messages and typing
/// users are the slices for the selected conversation.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub selected_conversation_id: Option<String>,
    pub current_user: Option<User>,
    pub typing_users: Vec<String>,
    pub online_users: Vec<String>,
    pub error: Option<String>,
    pub loading: bool,
}

/// Synchronous reducer over all chat state. Every mutation is a named
/// method; nothing outside this type touches the collections directly.
pub struct ChatState {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Message>,
    by_conversation: HashMap<String, Vec<String>>,
    selected_conversation_id: Option<String>,
    current_user: Option<User>,
    typing: HashMap<String, HashSet<String>>,
    online: HashSet<String>,
    error: Option<String>,
    loading: bool,
    load_generations: HashMap<String, u64>,
    list_generation: u64,
}

impl ChatState {
    pub fn new() -> Self {
        ChatState {
            conversations: HashMap::new(),
            messages: HashMap::new(),
            by_conversation: HashMap::new(),
            selected_conversation_id: None,
            current_user: None,
            typing: HashMap::new(),
            online: HashSet::new(),
            error: None,
            loading: false,
            load_generations: HashMap::new(),
            list_generation: 0,
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let mut conversations: Vec<Conversation> = self.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let selected = self.selected_conversation_id.clone();
        let messages = selected
            .as_deref()
            .map(|id| self.messages_for(id))
            .unwrap_or_default();
        let typing_users = selected
            .as_deref()
            .map(|id| self.typing_users(id))
            .unwrap_or_default();
        let mut online_users: Vec<String> = self.online.iter().cloned().collect();
        online_users.sort();
        ChatSnapshot {
            conversations,
            messages,
            selected_conversation_id: selected,
            current_user: self.current_user.clone(),
            typing_users,
            online_users,
            error: self.error.clone(),
            loading: self.loading,
        }
    }

    pub fn set_error(&mut self, text: impl Into<String>) {
        self.error = Some(text.into());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_current_user(&mut self, user: User) {
        self.current_user = Some(user);
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user.as_ref()
    }

    pub fn selected_conversation_id(&self) -> Option<&str> {
        self.selected_conversation_id.as_deref()
    }

    /// Set the selected conversation and return the previously selected id.
    pub fn select_conversation(&mut self, conversation_id: &str) -> Option<String> {
        debug!("Selected conversation {}", conversation_id);
        self.selected_conversation_id
            .replace(conversation_id.to_string())
    }

    /// Replace the conversation collection wholesale with a fresh list.
    pub fn replace_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();
        debug!("Conversation list replaced ({} conversations)", self.conversations.len());

        if let Some(selected) = &self.selected_conversation_id {
            if !self.conversations.contains_key(selected) {
                warn!("Selected conversation {} disappeared from the list", selected);
                self.selected_conversation_id = None;
            }
        }
    }

    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    /// Full-replace merge for one conversation's history: every previously
    /// held message for that conversation is dropped, then the fetched set
    /// is inserted. Repeating the same load is a no-op in effect.
    pub fn replace_messages(&mut self, conversation_id: &str, messages: Vec<Message>) {
        if let Some(old) = self.by_conversation.remove(conversation_id) {
            for id in old {
                self.messages.remove(&id);
            }
        }

        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            if message.conversation_id != conversation_id {
                warn!(
                    "Dropping message {} addressed to conversation {} from history for {}",
                    message.id, message.conversation_id, conversation_id
                );
                continue;
            }
            if self.messages.contains_key(&message.id) {
                debug!("Skipping duplicate message {} in history", message.id);
                continue;
            }
            ids.push(message.id.clone());
            self.messages.insert(message.id.clone(), message);
        }
        self.by_conversation.insert(conversation_id.to_string(), ids);
        self.refresh_last_message(conversation_id);
    }

    /// Insert a pushed or locally-originated message. Deduplicates by id
    /// and, for push echoes of an own send racing the REST confirmation,
    /// by client key; the echo wins the race by taking over the optimistic
    /// entry.
    pub fn add_message(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            debug!("Ignoring duplicate message {}", message.id);
            return false;
        }
        if let Some(key) = message.client_key.as_deref() {
            if let Some(existing_id) = self.find_by_client_key(&message.conversation_id, key) {
                if existing_id != message.id {
                    debug!(
                        "Message {} is the echo of {}; reconciling",
                        message.id, existing_id
                    );
                    self.swap_message(&existing_id, message);
                    return true;
                }
            }
        }

        let conversation_id = message.conversation_id.clone();
        let sender_id = message.sender_id.clone();
        self.by_conversation
            .entry(conversation_id.clone())
            .or_default()
            .push(message.id.clone());
        self.messages.insert(message.id.clone(), message);

        let from_other = self
            .current_user
            .as_ref()
            .map(|user| user.id != sender_id)
            .unwrap_or(true);
        let viewing = self.selected_conversation_id.as_deref() == Some(conversation_id.as_str());
        if from_other && !viewing {
            if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
                conversation.unread_count += 1;
            }
        }
        self.refresh_last_message(&conversation_id);
        true
    }

    /// Reconcile an optimistic send with the authoritative message returned
    /// by the REST call: an identity swap, not a field merge. If a push
    /// echo already performed the swap this is a no-op.
    pub fn confirm_send(&mut self, temp_id: &str, message: Message) -> bool {
        if self.messages.contains_key(temp_id) {
            self.swap_message(temp_id, message);
            return true;
        }
        if self.messages.contains_key(&message.id) {
            debug!("Send {} already reconciled as {}", temp_id, message.id);
            return true;
        }
        debug!("Optimistic message {} vanished; inserting confirmed copy", temp_id);
        self.add_message(message)
    }

    /// Mark one send's own optimistic message as failed. Scoped to the
    /// originating temp id; other in-flight sends are untouched.
    pub fn fail_send(&mut self, temp_id: &str) -> bool {
        self.update_message_status(temp_id, MessageStatus::Failed)
    }

    /// Monotonic status update keyed by message id; unknown ids and
    /// non-forward transitions are no-ops.
    pub fn update_message_status(&mut self, id: &str, status: MessageStatus) -> bool {
        let message = match self.messages.get_mut(id) {
            Some(message) => message,
            None => {
                debug!("Status update for unknown message {}", id);
                return false;
            }
        };
        if !message.status.can_advance_to(status) {
            debug!(
                "Ignoring non-forward status change {:?} -> {:?} for {}",
                message.status, status, id
            );
            return false;
        }
        message.status = status;
        let conversation_id = message.conversation_id.clone();

        // Keep the denormalized snapshot in step
        if let Some(conversation) = self.conversations.get_mut(&conversation_id) {
            if let Some(last) = conversation.last_message.as_mut() {
                if last.id == id {
                    last.status = status;
                }
            }
        }
        true
    }

    pub fn set_typing(&mut self, conversation_id: &str, user_id: &str, is_typing: bool) {
        if is_typing {
            self.typing
                .entry(conversation_id.to_string())
                .or_default()
                .insert(user_id.to_string());
        } else if let Some(users) = self.typing.get_mut(conversation_id) {
            users.remove(user_id);
            if users.is_empty() {
                self.typing.remove(conversation_id);
            }
        }
    }

    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .typing
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn set_user_online(&mut self, user_id: &str, is_online: bool) {
        if is_online {
            self.online.insert(user_id.to_string());
        } else {
            self.online.remove(user_id);
        }
        let status = if is_online {
            Presence::Online
        } else {
            Presence::Offline
        };
        for conversation in self.conversations.values_mut() {
            for participant in conversation
                .participants
                .iter_mut()
                .filter(|participant| participant.id == user_id)
            {
                participant.status = status;
            }
        }
        if let Some(user) = self.current_user.as_mut() {
            if user.id == user_id {
                user.status = status;
            }
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Zero the unread counter. Only called after the server accepted the
    /// mark-read call; there is no optimistic path here.
    pub fn mark_conversation_read(&mut self, conversation_id: &str) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.unread_count = 0;
                true
            }
            None => {
                debug!("Mark-read for unknown conversation {}", conversation_id);
                false
            }
        }
    }

    pub fn messages_for(&self, conversation_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .by_conversation
            .get(conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.messages.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by_key(|message| message.timestamp);
        messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn latest_message_id(&self, conversation_id: &str) -> Option<String> {
        self.by_conversation
            .get(conversation_id)?
            .iter()
            .filter_map(|id| self.messages.get(id))
            .max_by_key(|message| message.timestamp)
            .map(|message| message.id.clone())
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .values()
            .map(|conversation| conversation.unread_count)
            .sum()
    }

    /// Start a history load for a conversation and return its generation
    /// token. A later load for the same conversation supersedes it.
    pub fn begin_load(&mut self, conversation_id: &str) -> u64 {
        let counter = self
            .load_generations
            .entry(conversation_id.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn is_current_load(&self, conversation_id: &str, generation: u64) -> bool {
        self.load_generations.get(conversation_id).copied() == Some(generation)
    }

    pub fn begin_list_load(&mut self) -> u64 {
        self.list_generation += 1;
        self.list_generation
    }

    pub fn is_current_list_load(&self, generation: u64) -> bool {
        self.list_generation == generation
    }

    fn find_by_client_key(&self, conversation_id: &str, client_key: &str) -> Option<String> {
        self.by_conversation
            .get(conversation_id)?
            .iter()
            .find(|id| {
                self.messages
                    .get(id.as_str())
                    .and_then(|message| message.client_key.as_deref())
                    == Some(client_key)
            })
            .cloned()
    }

    // Replaces old_id with the authoritative message, keeping the original
    // timeline position and the client key when the server omits it.
    fn swap_message(&mut self, old_id: &str, mut message: Message) {
        if let Some(old) = self.messages.remove(old_id) {
            if message.client_key.is_none() {
                message.client_key = old.client_key;
            }
        }
        let ids = self
            .by_conversation
            .entry(message.conversation_id.clone())
            .or_default();
        if ids.contains(&message.id) {
            // The server id is already indexed (an echo landed without its
            // client key); the optimistic slot goes away instead.
            ids.retain(|id| id.as_str() != old_id);
        } else {
            match ids.iter_mut().find(|id| id.as_str() == old_id) {
                Some(slot) => *slot = message.id.clone(),
                None => ids.push(message.id.clone()),
            }
        }
        let conversation_id = message.conversation_id.clone();
        self.messages.insert(message.id.clone(), message);
        self.refresh_last_message(&conversation_id);
    }

    // The denormalized snapshot must track the newest message known for the
    // conversation; an empty local history leaves the server's snapshot
    // alone.
    fn refresh_last_message(&mut self, conversation_id: &str) {
        let latest = self.by_conversation.get(conversation_id).and_then(|ids| {
            ids.iter()
                .filter_map(|id| self.messages.get(id))
                .max_by_key(|message| message.timestamp)
                .cloned()
        });
        if let Some(conversation) = self.conversations.get_mut(conversation_id) {
            if let Some(message) = latest {
                conversation.last_message_time = Some(message.timestamp);
                if conversation.updated_at < message.timestamp {
                    conversation.updated_at = message.timestamp;
                }
                conversation.last_message = Some(message);
            }
        }
    }
}

/// Handle to the synchronization store. Cheap to clone; all clones share
/// the same state, API client and realtime channel. Callers receive one of
/// these instead of reaching for a global.
#[derive(Clone)]
pub struct ChatStore {
    state: Arc<TokioMutex<ChatState>>,
    api: Arc<dyn ChatApi>,
    channel: Arc<RealtimeChannel>,
}

impl ChatStore {
    pub fn new(api: Arc<dyn ChatApi>, transport: Arc<dyn SocketTransport>) -> Self {
        ChatStore {
            state: Arc::new(TokioMutex::new(ChatState::new())),
            api,
            channel: Arc::new(RealtimeChannel::new(transport)),
        }
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        self.state.lock().await.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state()
    }

    /// Fetch the authenticated user's profile into the store. Sends need
    /// this to stamp their sender id.
    pub async fn load_current_user(&self) {
        match self.api.current_user().await {
            Ok(user) => {
                let mut state = self.state.lock().await;
                state.set_current_user(user);
                state.clear_error();
            }
            Err(e) => {
                warn!("Could not load current user: {}", e);
                self.state.lock().await.set_error(e.to_string());
            }
        }
    }

    /// Replace the conversation collection from the backend. On failure the
    /// previous collection stays as it was and the error slice is set.
    pub async fn load_conversations(&self) {
        let generation = {
            let mut state = self.state.lock().await;
            state.set_loading(true);
            state.begin_list_load()
        };

        let result = self.api.fetch_conversations().await;

        let mut state = self.state.lock().await;
        if !state.is_current_list_load(generation) {
            debug!("Discarding superseded conversation list response");
            return;
        }
        state.set_loading(false);
        match result {
            Ok(conversations) => {
                state.replace_conversations(conversations);
                state.clear_error();
            }
            Err(e) => {
                warn!("Could not load conversations: {}", e);
                state.set_error(e.to_string());
            }
        }
    }

    /// Load one page of history for a conversation, replacing whatever was
    /// held for it before.
    pub async fn load_messages(&self, conversation_id: &str) {
        let generation = self.state.lock().await.begin_load(conversation_id);
        self.load_messages_generation(conversation_id, generation)
            .await;
    }

    async fn load_messages_generation(&self, conversation_id: &str, generation: u64) {
        self.state.lock().await.set_loading(true);

        let result = self
            .api
            .fetch_messages(conversation_id, MessageQuery::new())
            .await;

        let mut state = self.state.lock().await;
        // A superseded response must not clear the flag the newer load owns.
        if !state.is_current_load(conversation_id, generation) {
            debug!(
                "Discarding superseded history response for {}",
                conversation_id
            );
            return;
        }
        state.set_loading(false);
        match result {
            Ok(messages) => {
                state.replace_messages(conversation_id, messages);
                state.clear_error();
            }
            Err(e) => {
                warn!("Could not load messages for {}: {}", conversation_id, e);
                state.set_error(e.to_string());
            }
        }
    }

    /// Select a conversation: updates the selection, joins its event room
    /// (leaving the previous one), and loads its history.
    pub async fn select_conversation(&self, conversation_id: &str) {
        let (previous, generation) = {
            let mut state = self.state.lock().await;
            let previous = state.select_conversation(conversation_id);
            let generation = state.begin_load(conversation_id);
            (previous, generation)
        };

        if let Some(previous) = previous {
            if previous != conversation_id {
                self.channel.leave_conversation(&previous);
            }
        }
        self.channel.join_conversation(conversation_id);

        self.load_messages_generation(conversation_id, generation)
            .await;
    }

    /// Optimistic send. The message shows up immediately with `Sending`
    /// status under a temp id, goes out over the channel best-effort, and
    /// is persisted over REST. Returns the id the message ended up with:
    /// the server id on success, the temp id when the message was marked
    /// failed, `None` when there is no authenticated user to send as.
    pub async fn send_message(&self, conversation_id: &str, content: &str) -> Option<String> {
        let temp_id = format!("tmp-{}", Uuid::new_v4());
        let client_key = Uuid::new_v4().to_string();

        {
            let mut state = self.state.lock().await;
            let sender_id = match state.current_user() {
                Some(user) => user.id.clone(),
                None => {
                    warn!("Cannot send message: no authenticated user");
                    state.set_error("Cannot send message: not logged in");
                    return None;
                }
            };
            let message = Message {
                id: temp_id.clone(),
                conversation_id: conversation_id.to_string(),
                sender_id,
                content: content.to_string(),
                timestamp: chrono::Utc::now().timestamp() as u64,
                status: MessageStatus::Sending,
                kind: MessageKind::Text,
                reply_to: None,
                reactions: Vec::new(),
                client_key: Some(client_key.clone()),
            };
            state.add_message(message);
        }

        // Low-latency fan-out; the REST call below is what persists it.
        self.channel
            .send_message(conversation_id, content, &client_key);

        match self
            .api
            .send_message(conversation_id, content, MessageKind::Text, None, &client_key)
            .await
        {
            Ok(message) => {
                let final_id = message.id.clone();
                let mut state = self.state.lock().await;
                state.confirm_send(&temp_id, message);
                state.clear_error();
                debug!("Send {} confirmed as {}", temp_id, final_id);
                Some(final_id)
            }
            Err(e) => {
                error!("Send {} failed: {}", temp_id, e);
                let mut state = self.state.lock().await;
                state.fail_send(&temp_id);
                state.set_error(e.to_string());
                Some(temp_id)
            }
        }
    }

    /// Persist the read state, then zero the unread counter. Deliberately
    /// not optimistic: on failure the counter is left untouched.
    pub async fn mark_as_read(&self, conversation_id: &str) {
        match self.api.mark_read(conversation_id).await {
            Ok(()) => {
                let latest = {
                    let mut state = self.state.lock().await;
                    state.mark_conversation_read(conversation_id);
                    state.clear_error();
                    state.latest_message_id(conversation_id)
                };
                if let Some(message_id) = latest {
                    self.channel.mark_read(conversation_id, &message_id);
                }
            }
            Err(e) => {
                warn!("Could not mark {} as read: {}", conversation_id, e);
                self.state.lock().await.set_error(e.to_string());
            }
        }
    }

    /// Start a direct conversation with another user and return its id.
    pub async fn create_conversation(&self, participant_id: &str) -> Option<String> {
        match self.api.create_conversation(participant_id).await {
            Ok(conversation) => {
                let id = conversation.id.clone();
                let mut state = self.state.lock().await;
                state.upsert_conversation(conversation);
                state.clear_error();
                Some(id)
            }
            Err(e) => {
                warn!("Could not create conversation with {}: {}", participant_id, e);
                self.state.lock().await.set_error(e.to_string());
                None
            }
        }
    }

    pub fn start_typing(&self, conversation_id: &str) {
        self.channel.start_typing(conversation_id);
    }

    pub fn stop_typing(&self, conversation_id: &str) {
        self.channel.stop_typing(conversation_id);
    }

    /// Connect the realtime channel and start dispatching its events into
    /// the store. Requires a saved session for the auth token; calling
    /// while already connected changes nothing.
    pub async fn connect_websocket(&self) {
        let token = credentials::load_session()
            .ok()
            .flatten()
            .and_then(|session| session.get_token());
        let token = match token {
            Some(token) => token,
            None => {
                warn!("No saved session; realtime channel not connected");
                return;
            }
        };

        match self.channel.connect(&token).await {
            Ok(Some(inbound)) => {
                let store = self.clone();
                tokio::spawn(async move { store.dispatch_events(inbound).await });
            }
            Ok(None) => {}
            Err(e) => {
                error!("Realtime channel connect failed: {}", e);
                self.state.lock().await.set_error(e.to_string());
            }
        }
    }

    /// Tear the realtime channel down. Safe to call when never connected.
    pub fn disconnect_websocket(&self) {
        self.channel.disconnect();
    }

    async fn dispatch_events(self, mut inbound: mpsc::Receiver<String>) {
        info!("Channel dispatch started");
        while let Some(frame) = inbound.recv().await {
            match parse_frame(&frame) {
                Ok(Some(event)) => self.apply_event(event).await,
                Ok(None) => {}
                Err(e) => warn!("Dropping malformed channel frame: {}", e),
            }
        }

        // The transport closed the inbound side. If we did not ask for the
        // disconnect, reconnection was exhausted.
        if self.channel.is_connected() {
            warn!("Realtime connection lost");
            self.channel.disconnect();
            self.state
                .lock()
                .await
                .set_error("Realtime connection lost");
        }
        debug!("Channel dispatch stopped");
    }

    async fn apply_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived(message) => {
                self.state.lock().await.add_message(message);
            }
            ChannelEvent::MessageDelivered { message_id } => {
                self.state
                    .lock()
                    .await
                    .update_message_status(&message_id, MessageStatus::Delivered);
            }
            ChannelEvent::MessageRead { message_id } => {
                self.state
                    .lock()
                    .await
                    .update_message_status(&message_id, MessageStatus::Read);
            }
            ChannelEvent::TypingStarted {
                conversation_id,
                user_id,
            } => {
                self.state
                    .lock()
                    .await
                    .set_typing(&conversation_id, &user_id, true);
            }
            ChannelEvent::TypingStopped {
                conversation_id,
                user_id,
            } => {
                self.state
                    .lock()
                    .await
                    .set_typing(&conversation_id, &user_id, false);
            }
            ChannelEvent::UserOnline { user_id } => {
                self.state.lock().await.set_user_online(&user_id, true);
            }
            ChannelEvent::UserOffline { user_id } => {
                self.state.lock().await.set_user_online(&user_id, false);
            }
            ChannelEvent::ConversationUpdated { conversation_id } => {
                debug!("Conversation {} changed upstream; refreshing list", conversation_id);
                self.load_conversations().await;
            }
        }
    }
}
