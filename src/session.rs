use anyhow::{anyhow, Result};
use log::info;
use portal_chat::config::config_dir;
use portal_chat::Identity;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::PathBuf;

const SESSION_FILE_NAME: &str = "session.json";

/// Who signed in last time, and the chat they had open.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_participant: Option<String>,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Session {
            identity,
            last_participant: None,
        }
    }
}

fn session_dir() -> Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

fn session_path() -> Result<PathBuf> {
    Ok(session_dir()?.join(SESSION_FILE_NAME))
}

pub fn save_session(session: &Session) -> Result<()> {
    save_session_to(&session_path()?, session)
}

pub fn load_session() -> Result<Option<Session>> {
    load_session_from(&session_path()?)
}

pub fn save_session_to(path: &std::path::Path, session: &Session) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;
    info!("Session saved for {}", session.identity.user_id);
    Ok(())
}

pub fn load_session_from(path: &std::path::Path) -> Result<Option<Session>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let session: Session = serde_json::from_str(&contents)?;
    info!("Loaded session for {} from {}", session.identity.user_id, path.display());
    Ok(Some(session))
}
