//! Process configuration: defaults, an optional YAML file, then `APP_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RetentionPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerConfig,
    pub feed: FeedConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub version: String,
    pub environment: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "sports-news-storage".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_grace_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Endpoint prefix; the page size is appended verbatim.
    pub url: String,
    pub page_size: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "https://www.brentfordfc.com/api/incrowd/getnewlistinformation?count=".to_string(),
            page_size: 50,
            timeout_secs: 20,
            max_retries: 2,
            user_agent: "sns-bot/0.1".to_string(),
        }
    }
}

impl FeedConfig {
    pub fn request_url(&self, page_size: u32) -> String {
        format!("{}{}", self.url, page_size)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Full connection string; takes precedence over the discrete fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Table holding the article documents.
    pub collection: String,
    pub ttl_secs: u64,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            username: "sns".to_string(),
            password: "sns".to_string(),
            database: "news".to_string(),
            collection: "articles".to_string(),
            ttl_secs: 168 * 60 * 60,
            max_connections: 10,
            connect_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::new(Duration::from_secs(self.ttl_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub fetch_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_interval_secs: 15,
            sweep_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl AppConfig {
    /// Load from `APP_CONFIG_FILE` (or `config.yaml`) when present, then apply the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("APP_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut config = Self::from_file_if_exists(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file_if_exists(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_string(&lookup, "APP_NAME", &mut self.app.name);
        override_string(&lookup, "APP_VERSION", &mut self.app.version);
        override_string(&lookup, "APP_ENVIRONMENT", &mut self.app.environment);

        override_string(&lookup, "APP_SERVER_HOST", &mut self.server.host);
        override_parsed(&lookup, "APP_SERVER_PORT", &mut self.server.port)?;
        override_parsed(
            &lookup,
            "APP_SERVER_SHUTDOWN_GRACE_SECS",
            &mut self.server.shutdown_grace_secs,
        )?;

        override_string(&lookup, "APP_FEED_URL", &mut self.feed.url);
        override_parsed(&lookup, "APP_FEED_PAGE_SIZE", &mut self.feed.page_size)?;
        override_parsed(&lookup, "APP_FEED_TIMEOUT_SECS", &mut self.feed.timeout_secs)?;
        override_parsed(&lookup, "APP_FEED_MAX_RETRIES", &mut self.feed.max_retries)?;
        override_string(&lookup, "APP_FEED_USER_AGENT", &mut self.feed.user_agent);

        if let Some(value) = lookup("APP_STORE_BACKEND") {
            self.store.backend = match value.to_ascii_lowercase().as_str() {
                "postgres" => StoreBackend::Postgres,
                "memory" => StoreBackend::Memory,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "APP_STORE_BACKEND".to_string(),
                        value,
                    })
                }
            };
        }
        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("APP_STORE_URL")) {
            self.store.url = Some(url);
        }
        override_string(&lookup, "APP_STORE_HOST", &mut self.store.host);
        override_parsed(&lookup, "APP_STORE_PORT", &mut self.store.port)?;
        override_string(&lookup, "APP_STORE_USERNAME", &mut self.store.username);
        override_string(&lookup, "APP_STORE_PASSWORD", &mut self.store.password);
        override_string(&lookup, "APP_STORE_DATABASE", &mut self.store.database);
        override_string(&lookup, "APP_STORE_COLLECTION", &mut self.store.collection);
        override_parsed(&lookup, "APP_STORE_TTL_SECS", &mut self.store.ttl_secs)?;
        override_parsed(
            &lookup,
            "APP_STORE_MAX_CONNECTIONS",
            &mut self.store.max_connections,
        )?;
        override_parsed(
            &lookup,
            "APP_STORE_CONNECT_TIMEOUT_SECS",
            &mut self.store.connect_timeout_secs,
        )?;

        if let Some(value) = lookup("APP_SCHEDULER_ENABLED") {
            self.scheduler.enabled = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        override_parsed(
            &lookup,
            "APP_SCHEDULER_FETCH_INTERVAL_SECS",
            &mut self.scheduler.fetch_interval_secs,
        )?;
        override_parsed(
            &lookup,
            "APP_SCHEDULER_SWEEP_INTERVAL_SECS",
            &mut self.scheduler.sweep_interval_secs,
        )?;

        override_string(&lookup, "APP_LOG_LEVEL", &mut self.logger.level);
        if let Some(value) = lookup("APP_LOG_FORMAT") {
            self.logger.format = match value.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "APP_LOG_FORMAT".to_string(),
                        value,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.page_size == 0 {
            return Err(ConfigError::Invalid("feed.page_size must be positive".into()));
        }
        let request_url = self.feed.request_url(self.feed.page_size);
        if let Err(err) = url::Url::parse(&request_url) {
            return Err(ConfigError::Invalid(format!(
                "feed.url does not form a valid request url ({request_url}): {err}"
            )));
        }
        if self.scheduler.fetch_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.fetch_interval_secs must be positive".into(),
            ));
        }
        if self.scheduler.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.store.ttl_secs == 0 {
            return Err(ConfigError::Invalid("store.ttl_secs must be positive".into()));
        }
        if !is_sql_identifier(&self.store.collection) {
            return Err(ConfigError::InvalidValue {
                key: "store.collection".to_string(),
                value: self.store.collection.clone(),
            });
        }
        Ok(())
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn override_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_service_profile() {
        let config = AppConfig::default();
        assert_eq!(config.app.name, "sports-news-storage");
        assert_eq!(config.feed.page_size, 50);
        assert_eq!(config.scheduler.fetch_interval(), Duration::from_secs(15));
        assert_eq!(config.store.retention().ttl(), Duration::from_secs(604_800));
        assert_eq!(config.store.collection, "articles");
        assert!(config.validate().is_ok());
        assert!(config
            .feed
            .request_url(50)
            .ends_with("getnewlistinformation?count=50"));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("APP_FEED_PAGE_SIZE", "10"),
                ("APP_STORE_TTL_SECS", "600"),
                ("APP_STORE_BACKEND", "memory"),
                ("APP_SCHEDULER_ENABLED", "false"),
                ("APP_LOG_FORMAT", "json"),
                ("DATABASE_URL", "postgres://u:p@db:5432/news"),
            ]))
            .unwrap();
        assert_eq!(config.feed.page_size, 10);
        assert_eq!(config.store.ttl_secs, 600);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.logger.format, LogFormat::Json);
        assert_eq!(config.store.url.as_deref(), Some("postgres://u:p@db:5432/news"));
    }

    #[test]
    fn unparsable_override_is_reported() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[("APP_SERVER_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "APP_SERVER_PORT"));
    }

    #[test]
    fn yaml_file_is_optional_and_partial() {
        let dir = tempdir().expect("tempdir");
        let missing = AppConfig::from_file_if_exists(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(missing, AppConfig::default());

        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "feed:\n  page_size: 25\nstore:\n  collection: news_articles\n  ttl_secs: 3600\n",
        )
        .unwrap();
        let config = AppConfig::from_file_if_exists(&path).unwrap();
        assert_eq!(config.feed.page_size, 25);
        assert_eq!(config.store.collection, "news_articles");
        assert_eq!(config.store.ttl_secs, 3600);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut config = AppConfig::default();
        config.feed.url = "not a url ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.collection = "articles; drop table x".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scheduler.fetch_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
