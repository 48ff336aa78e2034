// Authentication configuration loaded from environment variables
// Decision: AUTH_ prefix for all auth config
// Decision: Default to "none" mode for local development
// Decision: Static API keys are configured by hash; plaintext keys are hashed on load

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::api_key::hash_api_key;
use crate::config::{ConfigError, Vars};

/// Authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// No authentication required (local development)
    #[default]
    None,
    /// Every request needs a JWT or an API key
    Enforced,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Enforced => "enforced",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(AuthMode::None),
            "enforced" => Ok(AuthMode::Enforced),
            other => Err(format!("unknown auth mode '{other}', expected none or enforced")),
        }
    }
}

/// A configured API key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticApiKey {
    pub subject: String,
    /// SHA-256 hex digest of the full key
    pub key_hash: String,
    pub scopes: Vec<String>,
}

/// Entry in AUTH_API_KEYS; exactly one of `key` or `keyHash`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyEntry {
    subject: String,
    key: Option<String>,
    key_hash: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

impl ApiKeyEntry {
    fn into_static(self) -> Result<StaticApiKey, String> {
        let key_hash = match (self.key, self.key_hash) {
            (Some(key), None) => hash_api_key(&key),
            (None, Some(hash)) => {
                if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(format!(
                        "keyHash for '{}' must be a SHA-256 hex digest",
                        self.subject
                    ));
                }
                hash.to_lowercase()
            }
            _ => {
                return Err(format!(
                    "api key for '{}' needs exactly one of key or keyHash",
                    self.subject
                ))
            }
        };
        Ok(StaticApiKey {
            subject: self.subject,
            key_hash,
            scopes: self.scopes,
        })
    }
}

/// Complete authentication configuration
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// HS256 secret for bearer tokens; JWTs are rejected when unset
    pub jwt_secret: Option<String>,
    pub api_keys: Vec<StaticApiKey>,
}

impl AuthConfig {
    /// Enforced mode with the given credentials
    pub fn enforced(jwt_secret: Option<String>, api_keys: Vec<StaticApiKey>) -> Self {
        Self {
            mode: AuthMode::Enforced,
            jwt_secret,
            api_keys,
        }
    }

    pub(crate) fn from_vars<F>(vars: &Vars<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode: AuthMode = vars.parse_or("AUTH_MODE", AuthMode::None)?;
        let jwt_secret = vars.get("AUTH_JWT_SECRET");
        let api_keys = match vars.get("AUTH_API_KEYS") {
            Some(raw) => parse_api_keys(&raw)
                .map_err(|message| ConfigError::invalid("AUTH_API_KEYS", message))?,
            None => Vec::new(),
        };

        if mode == AuthMode::Enforced && jwt_secret.is_none() && api_keys.is_empty() {
            return Err(ConfigError::invalid(
                "AUTH_MODE",
                "enforced mode needs AUTH_JWT_SECRET or AUTH_API_KEYS",
            ));
        }

        Ok(Self {
            mode,
            jwt_secret,
            api_keys,
        })
    }
}

fn parse_api_keys(raw: &str) -> Result<Vec<StaticApiKey>, String> {
    let entries: Vec<ApiKeyEntry> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    entries.into_iter().map(ApiKeyEntry::into_static).collect()
}
