//! # Client Configuration
//!
//! Settings that belong to the client rather than to the app it talks to.
//! The app's own configuration ([`relay_core::AppConfig`]) comes from an
//! external resolver and is not stored here.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     RELAY_SESSION_HASH=abc123                                          │
//! │     RELAY_TOKEN=hf_xxx   RELAY_JWT=eyJ...                              │
//! │     RELAY_PARENT_ORIGIN=https://huggingface.co                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/relay/client.toml (Linux)                                │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     generated session hash, no credentials                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [session]
//! hash = "f3a9c1d2e4"
//!
//! [auth]
//! token = "hf_xxx"
//! jwt = "eyJhbGciOi..."
//!
//! [authorization]
//! parent_origin = "https://huggingface.co"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, ClientResult};

/// Origin trusted to hand out elevated-compute headers.
pub const DEFAULT_PARENT_ORIGIN: &str = "https://huggingface.co";

// =============================================================================
// Sections
// =============================================================================

/// Session identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Opaque id sent with every join, stable for the client's lifetime.
    #[serde(default = "generate_session_hash")]
    pub hash: String,
}

fn generate_session_hash() -> String {
    Uuid::new_v4().simple().to_string()[..11].to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hash: generate_session_hash(),
        }
    }
}

/// Credentials. Acquiring them is somebody else's job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token sent as `Authorization` on HTTP requests.
    #[serde(default)]
    pub token: Option<String>,

    /// Signed token appended to stream URLs as `__sign`.
    #[serde(default)]
    pub jwt: Option<String>,
}

/// Elevated-compute authorization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Parent frames must report exactly this origin.
    #[serde(default = "default_parent_origin")]
    pub parent_origin: String,
}

fn default_parent_origin() -> String {
    DEFAULT_PARENT_ORIGIN.to_string()
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            parent_origin: default_parent_origin(),
        }
    }
}

// =============================================================================
// Client Config
// =============================================================================

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,
}

impl ClientConfig {
    /// Creates a config with defaults and a generated session hash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (client.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ClientResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading client config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load client config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> ClientResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ClientError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClientError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| ClientError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Client config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ClientResult<()> {
        if self.session.hash.trim().is_empty() {
            return Err(ClientError::InvalidConfig("session hash must not be empty".into()));
        }

        let origin = &self.authorization.parent_origin;
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(ClientError::InvalidUrl(format!(
                "Parent origin must start with http:// or https://, got: {}",
                origin
            )));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(hash) = std::env::var("RELAY_SESSION_HASH") {
            debug!(session_hash = %hash, "Overriding session hash from environment");
            self.session.hash = hash;
        }

        if let Ok(token) = std::env::var("RELAY_TOKEN") {
            self.auth.token = Some(token);
        }

        if let Ok(jwt) = std::env::var("RELAY_JWT") {
            self.auth.jwt = Some(jwt);
        }

        if let Ok(origin) = std::env::var("RELAY_PARENT_ORIGIN") {
            debug!(origin = %origin, "Overriding parent origin from environment");
            self.authorization.parent_origin = origin;
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "relay", "relay")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn session_hash(&self) -> &str {
        &self.session.hash
    }

    pub fn token(&self) -> Option<&str> {
        self.auth.token.as_deref()
    }

    pub fn jwt(&self) -> Option<&str> {
        self.auth.jwt.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.session_hash().len(), 11);
        assert!(config.token().is_none());
        assert_eq!(config.authorization.parent_origin, DEFAULT_PARENT_ORIGIN);
    }

    #[test]
    fn test_session_hashes_differ() {
        assert_ne!(ClientConfig::new().session.hash, ClientConfig::new().session.hash);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.session.hash = "  ".into();
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));

        config.session.hash = "abc".into();
        config.authorization.parent_origin = "huggingface.co".into();
        assert!(matches!(config.validate(), Err(ClientError::InvalidUrl(_))));
    }

    #[test]
    fn test_partial_toml() {
        let config: ClientConfig = toml::from_str("[auth]\njwt = \"signed\"\n").unwrap();
        assert_eq!(config.jwt(), Some("signed"));
        assert!(!config.session.hash.is_empty());
        assert_eq!(config.authorization.parent_origin, DEFAULT_PARENT_ORIGIN);
    }

    #[test]
    fn test_toml_serialization() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("[authorization]"));
    }
}
