use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domains::roles::{AssistantRole, RolePromptTable, UnknownRolePolicy};
use crate::error::{Result, TutorRelayError};

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7879;
pub const DEFAULT_TURN_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Upper bound on one upstream completion, first byte to last.
    pub turn_timeout_secs: Option<u64>,
    #[serde(default)]
    pub unknown_role: UnknownRolePolicy,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub openai: Option<OpenAiConfig>,
    pub server: Option<ServerConfig>,
    pub relay: Option<RelayConfig>,
    /// Per-role instruction overrides; roles not listed keep the built-in prompt.
    pub roles: Option<HashMap<AssistantRole, String>>,
}

impl Config {
    pub fn convention_defaults() -> Self {
        Self {
            openai: Some(OpenAiConfig {
                api_key: None,
                model: Some(crate::providers::openai::DEFAULT_MODEL.to_string()),
                base_url: Some(crate::providers::openai::DEFAULT_BASE_URL.to_string()),
            }),
            server: Some(ServerConfig {
                host: Some(DEFAULT_HOST.to_string()),
                port: Some(DEFAULT_PORT),
            }),
            relay: Some(RelayConfig {
                turn_timeout_secs: Some(DEFAULT_TURN_TIMEOUT_SECS),
                unknown_role: UnknownRolePolicy::Reject,
            }),
            roles: None,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            TutorRelayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| TutorRelayError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when it exists, otherwise falls back to the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_path(path)
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Ok(Self::convention_defaults())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TutorRelayError::Config(e.to_string()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).map_err(|e| TutorRelayError::Config(e.to_string()))
    }

    /// Fills a missing API key from `OPENAI_API_KEY`.
    pub fn resolve_env(mut self) -> Self {
        let openai = self.openai.get_or_insert_with(OpenAiConfig::default);
        if openai.api_key.as_deref().map_or(true, |key| key.trim().is_empty()) {
            if let Ok(key) = std::env::var(OPENAI_API_KEY_ENV) {
                openai.api_key = Some(key);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.role_prompts().map(|_| ())
    }

    pub fn role_prompts(&self) -> Result<RolePromptTable> {
        match &self.roles {
            Some(overrides) => RolePromptTable::with_overrides(overrides.clone()),
            None => Ok(RolePromptTable::default()),
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        self.openai.clone().unwrap_or_default()
    }

    pub fn host(&self) -> String {
        self.server
            .as_ref()
            .and_then(|server| server.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|server| server.port)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn turn_timeout(&self) -> Duration {
        let secs = self
            .relay
            .as_ref()
            .and_then(|relay| relay.turn_timeout_secs)
            .unwrap_or(DEFAULT_TURN_TIMEOUT_SECS);
        Duration::from_secs(secs.max(1))
    }

    pub fn unknown_role_policy(&self) -> UnknownRolePolicy {
        self.relay
            .as_ref()
            .map(|relay| relay.unknown_role)
            .unwrap_or_default()
    }
}
