use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine behavior for one [`RequestSession`](crate::RequestSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub read_write_timeout: Duration,
    pub keep_alive: bool,
    #[serde(with = "duration_ms")]
    pub keep_alive_timeout: Duration,
    pub max_keep_alive_requests: u32,
    pub reconnect: bool,
    pub reconnect_limit: u32,
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    pub allow_auto_redirect: bool,
    pub max_redirects: u32,
    pub ignore_protocol_errors: bool,
    /// Advertise `Accept-Encoding: gzip, deflate`.
    pub enable_encoding: bool,
    /// Culture name such as `ru-RU` used to build `Accept-Language`.
    pub culture: Option<String>,
    /// Charset name used to build `Accept-Charset`.
    pub charset: Option<String>,
    pub base_address: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(9),
            read_write_timeout: Duration::from_secs(24),
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(30),
            max_keep_alive_requests: 100,
            reconnect: false,
            reconnect_limit: 3,
            reconnect_delay: Duration::from_millis(100),
            allow_auto_redirect: true,
            max_redirects: 5,
            ignore_protocol_errors: false,
            enable_encoding: true,
            culture: None,
            charset: None,
            base_address: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be positive".into()));
        }
        if self.read_write_timeout.is_zero() {
            return Err(ConfigError::Invalid("read_write_timeout must be positive".into()));
        }
        if self.max_redirects < 1 {
            return Err(ConfigError::Invalid("max_redirects must be at least 1".into()));
        }
        if self.max_keep_alive_requests < 1 {
            return Err(ConfigError::Invalid(
                "max_keep_alive_requests must be at least 1".into(),
            ));
        }
        if let Some(charset) = &self.charset
            && charset.trim().is_empty()
        {
            return Err(ConfigError::Invalid("charset must not be blank".into()));
        }
        self.parsed_base_address()?;
        Ok(())
    }

    /// Base address as an absolute http(s) URL.
    pub fn parsed_base_address(&self) -> Result<Option<Url>, ConfigError> {
        let Some(base) = &self.base_address else {
            return Ok(None);
        };
        let url = Url::parse(base)
            .map_err(|err| ConfigError::Invalid(format!("base_address '{base}': {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "base_address '{base}' must use http or https"
            )));
        }
        Ok(Some(url))
    }
}

/// Tuning for the challenge bypass loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// Attempts per bypass call; a negative value retries without bound.
    pub max_retries: i32,
    /// Wait before replaying a solved challenge.
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    #[serde(with = "duration_ms")]
    pub cipher_cookie_ttl: Duration,
    /// Upper bound on a single captcha provider call.
    #[serde(with = "duration_ms")]
    pub captcha_timeout: Duration,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            delay: Duration::from_millis(5000),
            cipher_cookie_ttl: Duration::from_secs(30),
            captcha_timeout: Duration::from_secs(120),
        }
    }
}

impl BypassConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&read_file(path.as_ref())?)
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Budget as an attempt count, `None` when unbounded.
    pub fn attempt_budget(&self) -> Option<u32> {
        u32::try_from(self.max_retries).ok()
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
