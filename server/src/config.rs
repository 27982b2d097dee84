use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::flag::ReactionPolicy;
use crate::mention::{DEFAULT_MENTION_PATTERN, MentionExtractor};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("MENTION_PATTERN does not compile: {0}")]
    MentionPattern(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub max_message_length: usize,
    pub max_reply_hops: usize,
    pub allowed_reactions: Option<Vec<String>>,
    pub mention_pattern: String,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::from_path(".env").ok();

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let tls = match (env::var("CERT_PATH"), env::var("KEY_PATH")) {
            (Ok(cert_path), Ok(key_path)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            }),
            _ => None,
        };

        // Unset means the built-in list; set-but-empty disables the allow-list.
        let allowed_reactions = env::var("ALLOWED_REACTIONS").ok().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        });

        Ok(Self {
            database_url,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            tls,
            max_message_length: parse_var("MAX_MESSAGE_LENGTH", 0)?,
            max_reply_hops: parse_var("MAX_REPLY_HOPS", 16)?,
            allowed_reactions,
            mention_pattern: env::var("MENTION_PATTERN")
                .unwrap_or_else(|_| DEFAULT_MENTION_PATTERN.to_string()),
            outbox_poll_interval: Duration::from_millis(parse_var("OUTBOX_POLL_MS", 1000)?),
            outbox_batch_size: parse_var("OUTBOX_BATCH_SIZE", 100)?,
        })
    }

    pub fn messaging(&self) -> Result<MessagingConfig, ConfigError> {
        let reactions = match &self.allowed_reactions {
            None => ReactionPolicy::default(),
            Some(list) if list.is_empty() => ReactionPolicy::unrestricted(),
            Some(list) => ReactionPolicy::allow_list(list.iter().cloned()),
        };

        Ok(MessagingConfig {
            max_body_length: self.max_message_length,
            max_reply_hops: self.max_reply_hops,
            mentions: MentionExtractor::new(&self.mention_pattern)?,
            reactions,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub max_body_length: usize,
    pub max_reply_hops: usize,
    pub mentions: MentionExtractor,
    pub reactions: ReactionPolicy,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_body_length: 0,
            max_reply_hops: 16,
            mentions: MentionExtractor::default(),
            reactions: ReactionPolicy::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
