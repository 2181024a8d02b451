// Common test utilities for integration tests
// This module contains shared code for all integration tests

// Standard library imports
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

// External crate imports
use async_trait::async_trait;
use log::{info, LevelFilter};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration as TokioDuration};

// Import the crate functionality
use chatsync::api::{AuthSession, ChatApi, MessageQuery};
use chatsync::channel::{SocketHandle, SocketTransport};
use chatsync::credentials::{self, Session};
use chatsync::models::{
    Conversation, ConversationKind, Message, MessageKind, MessageStatus, Presence, User,
};
use chatsync::{ChatError, ChatSnapshot, ChatStore, Result};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .init();
    });
}

// The session path override is process wide, so every test in a binary
// shares one session file and it is written exactly once.
static INIT_SESSION: Once = Once::new();

/// Persist a session for the test user "me" in a temp location so the
/// store has an auth token to connect with.
pub fn ensure_session() {
    INIT_SESSION.call_once(|| {
        let dir = std::env::temp_dir().join(format!("chatsync-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("Failed to create temp session dir");
        credentials::set_session_path_override(dir.join("session.json"));
        let session = Session::new("me", "test-token");
        credentials::save_session(&session).expect("Failed to save test session");
    });
}

/// Build a user with the given id and predictable fields.
pub fn test_user(id: &str) -> User {
    User {
        id: id.to_string(),
        username: id.to_string(),
        email: format!("{}@example.com", id),
        avatar: None,
        status: Presence::Online,
        last_seen: None,
    }
}

/// Build an empty direct conversation with the given id.
pub fn test_conversation(id: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        name: format!("Conversation {}", id),
        kind: ConversationKind::Direct,
        participants: Vec::new(),
        last_message: None,
        last_message_time: None,
        unread_count: 0,
        archived: false,
        created_at: 1_714_464_000,
        updated_at: 1_714_464_000,
    }
}

/// Build a plain text message that is already confirmed by the server.
pub fn test_message(id: &str, conversation_id: &str, sender_id: &str, timestamp: u64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: format!("message {}", id),
        timestamp,
        status: MessageStatus::Sent,
        kind: MessageKind::Text,
        reply_to: None,
        reactions: Vec::new(),
        client_key: None,
    }
}

/// Wire-shaped message payload the way the server pushes it.
pub fn wire_message(id: &str, conversation_id: &str, sender_id: &str, timestamp: &str) -> Value {
    json!({
        "id": id,
        "content": format!("message {}", id),
        "senderId": sender_id,
        "conversationId": conversation_id,
        "timestamp": timestamp,
    })
}

/// One scripted response for a message history fetch.
pub struct ScriptedFetch {
    pub delay: Duration,
    pub result: Result<Vec<Message>>,
}

/// One scripted outcome for a send.
pub enum SendScript {
    /// Confirm the send with this server id after the delay.
    Confirm { id: String, delay: Duration },
    /// Reject the send with a network error.
    Fail,
}

impl SendScript {
    pub fn confirm(id: &str) -> Self {
        SendScript::Confirm {
            id: id.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn confirm_after(id: &str, delay: Duration) -> Self {
        SendScript::Confirm {
            id: id.to_string(),
            delay,
        }
    }
}

/// Scripted in-memory backend. Stable responses are configured with the
/// `set_*` methods; one-shot deviations (failures, delays) are queued with
/// the `script_*` / `fail_next_*` methods and consumed in order.
pub struct FakeApi {
    user: Mutex<Option<User>>,
    conversations: Mutex<Vec<Conversation>>,
    conversation_failures: Mutex<VecDeque<ChatError>>,
    message_pages: Mutex<HashMap<String, Vec<Message>>>,
    message_scripts: Mutex<HashMap<String, VecDeque<ScriptedFetch>>>,
    send_scripts: Mutex<VecDeque<SendScript>>,
    mark_read_failures: Mutex<VecDeque<ChatError>>,
    send_counter: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn new() -> Self {
        FakeApi {
            user: Mutex::new(None),
            conversations: Mutex::new(Vec::new()),
            conversation_failures: Mutex::new(VecDeque::new()),
            message_pages: Mutex::new(HashMap::new()),
            message_scripts: Mutex::new(HashMap::new()),
            send_scripts: Mutex::new(VecDeque::new()),
            mark_read_failures: Mutex::new(VecDeque::new()),
            send_counter: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_user(user: User) -> Self {
        let api = FakeApi::new();
        *api.user.lock().unwrap() = Some(user);
        api
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn fail_next_conversations(&self, error: ChatError) {
        self.conversation_failures.lock().unwrap().push_back(error);
    }

    pub fn set_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        self.message_pages
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), messages);
    }

    pub fn script_fetch(&self, conversation_id: &str, fetch: ScriptedFetch) {
        self.message_scripts
            .lock()
            .unwrap()
            .entry(conversation_id.to_string())
            .or_default()
            .push_back(fetch);
    }

    pub fn script_send(&self, script: SendScript) {
        self.send_scripts.lock().unwrap().push_back(script);
    }

    pub fn fail_next_mark_read(&self, error: ChatError) {
        self.mark_read_failures.lock().unwrap().push_back(error);
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls starting with the prefix.
    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        info!("FakeApi call: {}", call);
        self.calls.lock().unwrap().push(call);
    }

    fn sender_id(&self) -> String {
        self.user
            .lock()
            .unwrap()
            .as_ref()
            .map(|user| user.id.clone())
            .unwrap_or_else(|| "me".to_string())
    }

    fn confirmed_message(
        &self,
        id: String,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<String>,
        client_key: &str,
    ) -> Message {
        Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: self.sender_id(),
            content: content.to_string(),
            timestamp: chrono::Utc::now().timestamp() as u64,
            status: MessageStatus::Sent,
            kind,
            reply_to,
            reactions: Vec::new(),
            client_key: Some(client_key.to_string()),
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn login(&self, email: &str, _password: &str) -> Result<AuthSession> {
        self.record(format!("login {}", email));
        match self.user.lock().unwrap().clone() {
            Some(user) => Ok(AuthSession {
                token: "fake-token".to_string(),
                user,
            }),
            None => Err(ChatError::Auth("no scripted user".to_string())),
        }
    }

    async fn register(&self, username: &str, _email: &str, _password: &str) -> Result<AuthSession> {
        self.record(format!("register {}", username));
        match self.user.lock().unwrap().clone() {
            Some(user) => Ok(AuthSession {
                token: "fake-token".to_string(),
                user,
            }),
            None => Err(ChatError::Auth("no scripted user".to_string())),
        }
    }

    async fn logout(&self) -> Result<()> {
        self.record("logout".to_string());
        Ok(())
    }

    async fn current_user(&self) -> Result<User> {
        self.record("current_user".to_string());
        self.user
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ChatError::Auth("no scripted user".to_string()))
    }

    async fn refresh_token(&self) -> Result<String> {
        self.record("refresh_token".to_string());
        Ok("fake-token".to_string())
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        self.record("fetch_conversations".to_string());
        if let Some(error) = self.conversation_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        self.record(format!(
            "fetch_messages {} page={} limit={}",
            conversation_id, query.page, query.limit
        ));
        let scripted = self
            .message_scripts
            .lock()
            .unwrap()
            .get_mut(conversation_id)
            .and_then(|queue| queue.pop_front());
        if let Some(fetch) = scripted {
            tokio::time::sleep(fetch.delay).await;
            return fetch.result;
        }
        Ok(self
            .message_pages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<String>,
        client_key: &str,
    ) -> Result<Message> {
        self.record(format!("send_message {} {}", conversation_id, content));
        let script = self.send_scripts.lock().unwrap().pop_front();
        match script {
            Some(SendScript::Confirm { id, delay }) => {
                tokio::time::sleep(delay).await;
                Ok(self.confirmed_message(id, conversation_id, content, kind, reply_to, client_key))
            }
            Some(SendScript::Fail) => {
                Err(ChatError::Network("scripted send failure".to_string()))
            }
            None => {
                let id = format!("srv-{}", self.send_counter.fetch_add(1, Ordering::SeqCst) + 1);
                Ok(self.confirmed_message(id, conversation_id, content, kind, reply_to, client_key))
            }
        }
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        self.record(format!("mark_read {}", conversation_id));
        if let Some(error) = self.mark_read_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(())
    }

    async fn create_conversation(&self, participant_id: &str) -> Result<Conversation> {
        self.record(format!("create_conversation {}", participant_id));
        let mut conversation = test_conversation(&format!("direct-{}", participant_id));
        conversation.participants = vec![test_user(&self.sender_id()), test_user(participant_id)];
        self.conversations
            .lock()
            .unwrap()
            .push(conversation.clone());
        Ok(conversation)
    }
}

/// The test's side of a fake socket connection.
pub struct ServerEnd {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

impl ServerEnd {
    /// Push a frame to the client as if the server emitted it.
    pub async fn emit(&self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.to_client
            .send(frame)
            .await
            .expect("Client inbound side is closed");
    }

    /// Wait for the next frame the client emits.
    pub async fn next_outbound(&mut self) -> Value {
        match timeout(TokioDuration::from_secs(5), self.from_client.recv()).await {
            Ok(Some(frame)) => {
                serde_json::from_str(&frame).expect("Client emitted invalid JSON")
            }
            Ok(None) => panic!("Client outbound side is closed"),
            Err(_) => panic!("Timed out waiting for an outbound frame"),
        }
    }

    /// Frames the client has emitted so far, without waiting.
    pub fn drain_outbound(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("Client emitted invalid JSON"));
        }
        frames
    }
}

/// In-memory socket transport. Each successful connect hands the channel a
/// fresh pair of pipes and parks the far ends here for the test to drive.
pub struct FakeSocket {
    fail_connects: Mutex<u32>,
    dial_delays: Mutex<VecDeque<Duration>>,
    server_ends: Mutex<VecDeque<ServerEnd>>,
    tokens: Mutex<Vec<String>>,
}

impl FakeSocket {
    pub fn new() -> Self {
        FakeSocket {
            fail_connects: Mutex::new(0),
            dial_delays: Mutex::new(VecDeque::new()),
            server_ends: Mutex::new(VecDeque::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Make the next connect attempt fail.
    pub fn fail_next_connect(&self) {
        *self.fail_connects.lock().unwrap() += 1;
    }

    /// Hold the next connect attempt open for the given duration before it
    /// succeeds, so tests can act while the dial is in flight.
    pub fn delay_next_connect(&self, delay: Duration) {
        self.dial_delays.lock().unwrap().push_back(delay);
    }

    /// Take the server side of the oldest connection not yet claimed.
    pub fn server_end(&self) -> ServerEnd {
        self.server_ends
            .lock()
            .unwrap()
            .pop_front()
            .expect("No fake socket connection was made")
    }

    pub fn connect_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketTransport for FakeSocket {
    async fn connect(&self, token: &str) -> Result<SocketHandle> {
        {
            let mut failures = self.fail_connects.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChatError::Channel("scripted connect failure".to_string()));
            }
        }
        let delay = self.dial_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.tokens.lock().unwrap().push(token.to_string());

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        self.server_ends.lock().unwrap().push_back(ServerEnd {
            to_client: inbound_tx,
            from_client: outbound_rx,
        });
        Ok(SocketHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Build a store wired to fresh fakes, with "me" as the signed-in user.
pub async fn setup_store() -> (ChatStore, Arc<FakeApi>, Arc<FakeSocket>) {
    setup_logging();
    let api = Arc::new(FakeApi::with_user(test_user("me")));
    let socket = Arc::new(FakeSocket::new());
    let store = ChatStore::new(api.clone(), socket.clone());
    store.load_current_user().await;
    (store, api, socket)
}

/// Wait until the store snapshot satisfies the predicate. Panics with the
/// description when the deadline passes, so tests fail with a readable
/// message instead of a hang.
pub async fn wait_for_state(
    store: &ChatStore,
    description: &str,
    predicate: impl Fn(&ChatSnapshot) -> bool,
) -> ChatSnapshot {
    info!("Waiting for {}", description);
    let result = timeout(TokioDuration::from_secs(5), async {
        loop {
            let snapshot = store.snapshot().await;
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(TokioDuration::from_millis(10)).await;
        }
    })
    .await;
    match result {
        Ok(snapshot) => snapshot,
        Err(_) => panic!("Timed out waiting for {}", description),
    }
}
