use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::info;
use once_cell::sync::OnceCell;

/// Persisted authentication session. The token is written base64-encoded;
/// presence of the session file is the sole local authentication check.
#[derive(Serialize, Deserialize, Clone)]
pub struct Session {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Session {
    pub fn new(user_id: &str, token: &str) -> Self {
        Session {
            user_id: user_id.to_string(),
            token: Some(BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().map(|encoded| {
            String::from_utf8(
                BASE64.decode(encoded).unwrap_or_default()
            ).unwrap_or_default()
        })
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatsync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_session(session: &Session) -> Result<()> {
    let session_path = get_session_path()?;
    let file = File::create(session_path)?;
    serde_json::to_writer_pretty(file, session)?;

    info!("Session saved for {}", session.user_id);
    Ok(())
}

pub fn load_session() -> Result<Option<Session>> {
    let session_path = get_session_path()?;

    if !session_path.exists() {
        return Ok(None);
    }

    // Keep the path as a string for logging before the PathBuf moves
    let session_path_str = session_path.display().to_string();

    let mut file = File::open(session_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let session: Session = serde_json::from_str(&contents)?;
    info!("Loaded session for {} from {}", session.user_id, session_path_str);

    Ok(Some(session))
}

/// Remove the persisted session. Missing file is not an error, so logout
/// can always be called.
pub fn clear_session() -> Result<()> {
    let session_path = get_session_path()?;

    if session_path.exists() {
        fs::remove_file(&session_path)?;
        info!("Cleared session at {}", session_path.display());
    }

    Ok(())
}

pub fn is_authenticated() -> bool {
    get_session_path().map(|path| path.exists()).unwrap_or(false)
}

static SESSION_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

pub fn set_session_path_override(path: PathBuf) {
    let _ = SESSION_PATH_OVERRIDE.set(path);
}

fn get_session_path() -> Result<PathBuf> {
    if let Some(path) = SESSION_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("session.json"))
}
