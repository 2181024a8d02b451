// Authentication endpoints and session persistence
// Login and register store the returned token through the credentials
// module so later REST calls and the realtime channel can authenticate.

use log::{debug, info, warn};
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::credentials::{self, Session};
use crate::error::{ChatError, Result};
use crate::models::{Presence, User};

#[derive(Debug, Serialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUserDto {
    pub id: String,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    pub is_online: bool,
}

impl AuthUserDto {
    pub fn into_model(self) -> User {
        let status = if self.is_online {
            Presence::Online
        } else {
            Presence::Offline
        };
        User {
            id: self.id,
            username: self.username,
            email: self.email,
            avatar: self.avatar,
            status,
            last_seen: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponseDto {
    token: String,
    user: AuthUserDto,
}

#[derive(Debug, Deserialize)]
struct TokenResponseDto {
    token: String,
}

/// Result of a successful login or registration.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user: User,
}

fn store_session(user_id: &str, token: &str) -> Result<()> {
    credentials::save_session(&Session::new(user_id, token))
        .map_err(|e| ChatError::Auth(format!("could not persist session: {}", e)))
}

impl super::HttpApi {
    /// Log in with email and password. On success the token is persisted
    /// locally, which is what the rest of the client treats as being
    /// authenticated.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        debug!("Logging in as {}", email);
        let res = self
            .request(Method::POST, "/api/auth/login")
            .json(&LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: AuthResponseDto = serde_json::from_str(&body)?;
        let user = parsed.user.into_model();
        store_session(&user.id, &parsed.token)?;
        info!("Logged in as {}", user.username);
        Ok(AuthSession {
            token: parsed.token,
            user,
        })
    }

    /// Create an account and log straight into it.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthSession> {
        debug!("Registering account {}", username);
        let res = self
            .request(Method::POST, "/api/auth/register")
            .json(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: AuthResponseDto = serde_json::from_str(&body)?;
        let user = parsed.user.into_model();
        store_session(&user.id, &parsed.token)?;
        info!("Registered and logged in as {}", user.username);
        Ok(AuthSession {
            token: parsed.token,
            user,
        })
    }

    /// Log out on the server, then drop the local session. The session is
    /// kept if the server call fails so the user can retry.
    pub async fn logout(&self) -> Result<()> {
        self.request(Method::POST, "/api/auth/logout")
            .send()
            .await?
            .error_for_status()?;
        credentials::clear_session()
            .map_err(|e| ChatError::Auth(format!("could not clear session: {}", e)))?;
        info!("Logged out");
        Ok(())
    }

    /// Fetch the authenticated user's own profile.
    pub async fn current_user(&self) -> Result<User> {
        let res = self
            .request(Method::GET, "/api/auth/me")
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: AuthUserDto = serde_json::from_str(&body)?;
        Ok(parsed.into_model())
    }

    /// Exchange the current token for a fresh one. The stored session keeps
    /// its user id; with no stored session the new token is returned but not
    /// persisted.
    pub async fn refresh_token(&self) -> Result<String> {
        let res = self
            .request(Method::POST, "/api/auth/refresh")
            .send()
            .await?
            .error_for_status()?;
        let body = res.text().await?;
        let parsed: TokenResponseDto = serde_json::from_str(&body)?;
        match credentials::load_session() {
            Ok(Some(session)) => store_session(&session.user_id, &parsed.token)?,
            _ => warn!("Refreshed a token without a saved session; not persisting it"),
        }
        Ok(parsed.token)
    }
}
