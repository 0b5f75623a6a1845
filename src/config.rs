use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub feed: FeedConfig,
    #[serde(default)]
    pub revalidation: RevalidationConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}

/// Connection settings for the CouchDB `_changes` feed.
#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl FeedConfig {
    /// Base URL of the database, without a trailing slash.
    pub fn database_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.database.trim_matches('/')
        )
    }
}

/// Settings for the downstream cache revalidation hook.
///
/// An absent or empty `secret` disables notifications entirely.
#[derive(Debug, Deserialize, Clone)]
pub struct RevalidationConfig {
    #[serde(default = "default_revalidation_url")]
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RevalidationConfig {
    fn default() -> Self {
        Self {
            url: default_revalidation_url(),
            secret: None,
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_revalidation_url() -> String {
    "http://localhost:3000/api/revalidate-posts".to_string()
}
fn default_request_timeout_secs() -> u64 {
    5
}

/// Path prefixes that select which documents get indexed.
#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_blog_prefix")]
    pub blog_prefix: String,
    #[serde(default = "default_kb_prefix")]
    pub kb_prefix: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            blog_prefix: default_blog_prefix(),
            kb_prefix: default_kb_prefix(),
        }
    }
}

fn default_blog_prefix() -> String {
    "blog/".to_string()
}
fn default_kb_prefix() -> String {
    "kb/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_threshold: default_threshold(),
        }
    }
}

fn default_limit() -> i64 {
    15
}
fn default_threshold() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_generation_url")]
    pub base_url: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_generation_url(),
            timeout_secs: default_generation_timeout_secs(),
            system_prompt: None,
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generation_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RevalidationConfig {
    /// The configured secret, treating an empty string as unset.
    pub fn effective_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parses and validates a TOML configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.feed.base_url.trim().is_empty() {
        anyhow::bail!("feed.base_url must not be empty");
    }
    if config.feed.database.trim().is_empty() {
        anyhow::bail!("feed.database must not be empty");
    }
    if config.feed.connect_timeout_secs == 0 {
        anyhow::bail!("feed.connect_timeout_secs must be > 0");
    }

    if config.revalidation.timeout_secs == 0 {
        anyhow::bail!("revalidation.timeout_secs must be > 0");
    }

    if config.content.blog_prefix.is_empty() || config.content.kb_prefix.is_empty() {
        anyhow::bail!("content.blog_prefix and content.kb_prefix must not be empty");
    }

    if config.retrieval.default_limit < 1 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.default_threshold) {
        anyhow::bail!("retrieval.default_threshold must be in [0.0, 1.0]");
    }

    Ok(config)
}

/// Secrets may be supplied through the environment instead of the file.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(secret) = std::env::var("REVALIDATE_SECRET") {
        config.revalidation.secret = Some(secret);
    }
    if let Ok(url) = std::env::var("REVALIDATE_POSTS_URL") {
        if !url.trim().is_empty() {
            config.revalidation.url = url;
        }
    }
    if let Ok(password) = std::env::var("COUCHDB_PASSWORD") {
        config.feed.password = Some(password);
    }
}
