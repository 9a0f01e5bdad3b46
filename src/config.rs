//! Client configuration: TOML file, then environment, then CLI flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::protocol::QueryType;
use crate::streaming::RevealConfig;

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "stock-chat.toml";

pub const ENV_API_URL: &str = "STOCK_CHAT_API_URL";
pub const ENV_WS_URL: &str = "STOCK_CHAT_WS_URL";
pub const ENV_TOKEN: &str = "STOCK_CHAT_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// `/query` on current backends, `/api/query` on older ones.
    pub query_path: String,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            query_path: "/query".to_string(),
            timeout_secs: 60,
            auth_token: None,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// `{client_id}` is replaced with a generated id on connect.
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Interval between `ping` frames; `0` disables the heartbeat.
    pub heartbeat_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/{client_id}".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    /// A query type name, or `auto` to detect it from the question.
    pub query_type: String,
    pub top_k: u32,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            query_type: "auto".to_string(),
            top_k: 5,
        }
    }
}

impl QueryDefaults {
    /// `None` means detect per question.
    pub fn fixed_type(&self) -> Result<Option<QueryType>> {
        if self.query_type.trim().eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        QueryType::from_str_loose(&self.query_type)
            .map(Some)
            .map_err(ChatError::Config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api: ApiConfig,
    pub socket: SocketConfig,
    pub streaming: RevealConfig,
    pub query: QueryDefaults,
}

impl ChatConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ChatError::Config(e.to_string()))
    }

    /// Load `path`, or [`DEFAULT_CONFIG_FILE`] when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit): (PathBuf, bool) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let cfg = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Self::default(),
            Err(e) => {
                return Err(ChatError::Config(format!("{}: {}", path.display(), e)));
            }
        };
        Ok(cfg)
    }

    /// Apply `STOCK_CHAT_*` variables through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api.base_url = url;
        }
        if let Some(url) = lookup(ENV_WS_URL).filter(|v| !v.is_empty()) {
            self.socket.url = url;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
            self.api.auth_token = Some(token);
        }
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|k| std::env::var(k).ok());
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.api.base_url)
            .map_err(|e| ChatError::Config(format!("api.base_url: {e}")))?;
        let ws = self.socket.url.replace("{client_id}", "probe");
        let ws = reqwest::Url::parse(&ws).map_err(|e| ChatError::Config(format!("socket.url: {e}")))?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(ChatError::Config(format!(
                "socket.url: expected ws:// or wss://, got {}://",
                ws.scheme()
            )));
        }
        if !self.api.query_path.starts_with('/') {
            return Err(ChatError::Config("api.query_path must start with '/'".into()));
        }
        if self.streaming.chars_per_tick == 0 {
            return Err(ChatError::Config("streaming.chars_per_tick must be > 0".into()));
        }
        if self.streaming.tick_ms == 0 {
            return Err(ChatError::Config("streaming.tick_ms must be > 0".into()));
        }
        if self.query.top_k == 0 {
            return Err(ChatError::Config("query.top_k must be > 0".into()));
        }
        self.query.fixed_type()?;
        Ok(())
    }
}
