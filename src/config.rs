//! Runtime configuration.
//!
//! Loaded once from a TOML file (plus `DISCORD_TOKEN` from the environment)
//! before any shard opens, then shared read-only behind an `Arc`.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::processors::invite_link::InviteLinkConfig;

/// Environment variable that overrides the `token` key.
pub const TOKEN_ENV: &str = "DISCORD_TOKEN";

pub const DEFAULT_PREFIX: &str = "-mod";
pub const DEFAULT_SUCCESS_EMOJI: &str = "jimsuccess:322698554294534144";
pub const DEFAULT_FAIL_EMOJI: &str = "jimfail:322698553980092417";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bot token, sent as `Bot <token>`.
    pub token: String,
    /// Number of gateway shards to open. Fixed for the runtime's lifetime.
    pub shard_count: u32,
    /// Literal first token marking a command invocation, e.g. `-mod ping`.
    pub prefix: String,
    pub default_language: String,
    /// React with the success emoji to every non-command message.
    pub acknowledge_messages: bool,
    pub success_emoji: String,
    pub fail_emoji: String,
    pub invite_filter: InviteLinkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            shard_count: 1,
            prefix: DEFAULT_PREFIX.to_string(),
            default_language: "en".to_string(),
            acknowledge_messages: true,
            success_emoji: DEFAULT_SUCCESS_EMOJI.to_string(),
            fail_emoji: DEFAULT_FAIL_EMOJI.to_string(),
            invite_filter: InviteLinkConfig::default(),
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("token", &"[REDACTED]")
            .field("shard_count", &self.shard_count)
            .field("prefix", &self.prefix)
            .field("default_language", &self.default_language)
            .field("acknowledge_messages", &self.acknowledge_messages)
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    /// Read `path` (a missing file means "all defaults"), apply the
    /// environment override and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => {
                info!(path = %path.display(), "loaded config file");
                toml::from_str(&raw)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document without touching the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment (looked up through `lookup`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            self.token = token.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "no bot token: set `token` or {}",
                TOKEN_ENV
            )));
        }
        if self.shard_count == 0 {
            return Err(ConfigError::Invalid("shard_count must be at least 1".into()));
        }
        if self.prefix.is_empty() || self.prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "prefix {:?} must be a single non-empty token",
                self.prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            token = "abc"
            shard_count = 2
            prefix = "!jim"
            default_language = "tr"
            acknowledge_messages = false

            [invite_filter]
            blacklisted_hosts = ["discord.gg", "discord.com"]
            min_token_length = 8
            exempt_roles = ["Moderator"]
            "#,
        )
        .unwrap();

        assert_eq!(config.shard_count, 2);
        assert_eq!(config.prefix, "!jim");
        assert_eq!(config.default_language, "tr");
        assert!(!config.acknowledge_messages);
        assert_eq!(config.success_emoji, DEFAULT_SUCCESS_EMOJI);
        assert_eq!(config.invite_filter.min_token_length, 8);
        assert!(config.invite_filter.exempt_roles.contains("Moderator"));
        assert_eq!(config.invite_filter.blacklisted_hosts.len(), 2);
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let config = RuntimeConfig::from_toml_str(r#"token = "abc""#).unwrap();
        assert_eq!(config.shard_count, 1);
        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert!(config.acknowledge_messages);
        assert!(config.invite_filter.blacklisted_hosts.contains("discord.gg"));
    }

    #[test]
    fn rejects_missing_token() {
        let err = RuntimeConfig::from_toml_str("shard_count = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_shards() {
        let err = RuntimeConfig::from_toml_str("token = \"t\"\nshard_count = 0").unwrap_err();
        assert!(err.to_string().contains("shard_count"));
    }

    #[test]
    fn rejects_prefix_with_whitespace() {
        let err = RuntimeConfig::from_toml_str("token = \"t\"\nprefix = \"- mod\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = RuntimeConfig::from_toml_str("token = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_token_overrides_file() {
        let mut config = RuntimeConfig {
            token: "from-file".into(),
            ..RuntimeConfig::default()
        };
        config.apply_env(|key| (key == TOKEN_ENV).then(|| " from-env ".to_string()));
        assert_eq!(config.token, "from-env");

        config.apply_env(|_| Some("   ".to_string()));
        assert_eq!(config.token, "from-env");
    }

    #[test]
    fn debug_redacts_token() {
        let config = RuntimeConfig {
            token: "super-secret".into(),
            ..RuntimeConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
