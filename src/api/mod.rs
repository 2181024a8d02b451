// REST transport for the chat backend
// Thin typed wrappers over the HTTP endpoints; every response is validated
// against the expected shape before anything reaches the store.

use async_trait::async_trait;
use reqwest::Method;

use crate::credentials;
use crate::error::Result;
use crate::models::{Conversation, Message, MessageKind, User};

pub mod auth;
pub mod chat;

pub use auth::AuthSession;
pub use chat::MessageQuery;

/// Request/response contract the synchronization store depends on. Kept as
/// a trait so tests can drive the store against a scripted backend.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<AuthSession>;
    async fn register(&self, username: &str, email: &str, password: &str)
        -> Result<AuthSession>;
    async fn logout(&self) -> Result<()>;
    async fn current_user(&self) -> Result<User>;
    async fn refresh_token(&self) -> Result<String>;
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;
    async fn fetch_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<Message>>;
    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<String>,
        client_key: &str,
    ) -> Result<Message>;
    async fn mark_read(&self, conversation_id: &str) -> Result<()>;
    async fn create_conversation(&self, participant_id: &str) -> Result<Conversation>;
}

/// REST client backed by reqwest. The bearer token is read from the saved
/// session on every request, so a login performed through this client
/// authenticates the calls that follow it.
pub struct HttpApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpApi {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // Requests without a stored token are still sent; the server answers
    // 401 and the error mapping turns that into an authentication failure.
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, self.url(path));
        if let Some(token) = credentials::load_session()
            .ok()
            .flatten()
            .and_then(|session| session.get_token())
        {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        HttpApi::login(self, email, password).await
    }

    async fn register(&self, username: &str, email: &str, password: &str)
        -> Result<AuthSession> {
        HttpApi::register(self, username, email, password).await
    }

    async fn logout(&self) -> Result<()> {
        HttpApi::logout(self).await
    }

    async fn current_user(&self) -> Result<User> {
        HttpApi::current_user(self).await
    }

    async fn refresh_token(&self) -> Result<String> {
        HttpApi::refresh_token(self).await
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        HttpApi::fetch_conversations(self).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        HttpApi::fetch_messages(self, conversation_id, query).await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        reply_to: Option<String>,
        client_key: &str,
    ) -> Result<Message> {
        HttpApi::send_message(self, conversation_id, content, kind, reply_to, client_key).await
    }

    async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        HttpApi::mark_read(self, conversation_id).await
    }

    async fn create_conversation(&self, participant_id: &str) -> Result<Conversation> {
        HttpApi::create_conversation(self, participant_id).await
    }
}
