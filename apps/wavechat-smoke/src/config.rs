//! Environment-backed runtime configuration for `wavechat-smoke`.

use std::{env, error::Error, fmt};

use chat_client::RuntimeConfig;
use chat_core::ReconcilerConfig;

const DEFAULT_USER: &str = "smoke-user";
const DEFAULT_CONVERSATION: &str = "smoke";
const DEFAULT_PAGINATE_LIMIT: u16 = 30;

/// Runtime configuration used by the smoke binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// User id the runtime acts as.
    pub user_id: String,
    /// Conversation opened by the smoke run.
    pub conversation_id: String,
    /// Optional REST API base URL. When unset, the in-memory API is used.
    pub api_url: Option<String>,
    /// Optional bearer token passed to the REST API.
    pub auth_token: Option<String>,
    /// Page size for the initial load and pagination.
    pub paginate_limit: u16,
    /// Reconciliation windows and typing TTL.
    pub reconciler: ReconcilerConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("WAVECHAT_USER", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER.to_owned());
        let conversation_id = optional_trimmed_env("WAVECHAT_CONVERSATION", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CONVERSATION.to_owned());
        let api_url = optional_trimmed_env("WAVECHAT_API_URL", &mut lookup);
        let auth_token = optional_trimmed_env("WAVECHAT_TOKEN", &mut lookup);

        let paginate_limit = parse_optional_u16(
            "WAVECHAT_PAGINATE_LIMIT",
            DEFAULT_PAGINATE_LIMIT,
            &mut lookup,
        )?;
        if paginate_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WAVECHAT_PAGINATE_LIMIT",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let defaults = ReconcilerConfig::default();
        let reconciler = ReconcilerConfig {
            echo_window_ms: parse_optional_u64(
                "WAVECHAT_ECHO_WINDOW_MS",
                defaults.echo_window_ms,
                &mut lookup,
            )?,
            fingerprint_window_ms: parse_optional_u64(
                "WAVECHAT_FINGERPRINT_WINDOW_MS",
                defaults.fingerprint_window_ms,
                &mut lookup,
            )?,
            typing_ttl_ms: parse_optional_u64(
                "WAVECHAT_TYPING_TTL_MS",
                defaults.typing_ttl_ms,
                &mut lookup,
            )?,
        };

        Ok(Self {
            user_id,
            conversation_id,
            api_url,
            auth_token,
            paginate_limit,
            reconciler,
        })
    }

    /// Runtime settings derived from this config.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            viewer_id: self.user_id.clone(),
            page_limit: self.paginate_limit,
            reconciler: self.reconciler,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(
    key: &'static str,
    default: u16,
    lookup: &mut F,
) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u16>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}
