use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost/memoria/backend";
pub const API_PATH: &str = "api/index.php";
pub const DEFAULT_MODEL: &str = "deepseek-r1";

/// Conversations that keep their full message bodies locally.
pub const FULL_HISTORY_LIMIT: usize = 30;
/// Hard cap on locally stored conversations, metadata included.
pub const CONVERSATION_LIMIT: usize = 100;
/// Below this many local conversations an authenticated user pulls history from the backend.
pub const FALLBACK_THRESHOLD: usize = 30;
pub const MAX_CONTEXT_MESSAGES: usize = 10;
/// Inline file content above this many bytes moves to the file store.
pub const LARGE_CONTENT_THRESHOLD: usize = 1500;

pub mod storage_keys {
    pub const TOKEN: &str = "memoria_token";
    pub const USER: &str = "memoria_user";
    pub const CHAT_HISTORY: &str = "chatHistory";
    pub const SELECTED_MODEL: &str = "selectedAIModel";
    pub const CONTEXT_PLUS: &str = "contextPlusEnabled";
}

const BACKEND_URL_ENV: &str = "ECHO_BACKEND_URL";
const DB_PATH_ENV: &str = "ECHO_DB_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub backend_url: String,
    pub db_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let backend_url =
            std::env::var(BACKEND_URL_ENV).unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let db_path = match std::env::var(DB_PATH_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::default_db_path()?,
        };
        Ok(Self {
            backend_url,
            db_path,
        })
    }

    pub fn default_db_path() -> Result<PathBuf> {
        let data_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME").context("HOME not set")?;
                PathBuf::from(home).join(".local/share")
            }
        };
        Ok(data_dir.join("echo").join("history.db"))
    }

    pub fn with_overrides(mut self, backend_url: Option<String>, db_path: Option<PathBuf>) -> Self {
        if let Some(url) = backend_url {
            self.backend_url = url;
        }
        if let Some(path) = db_path {
            self.db_path = path;
        }
        self
    }
}
