//! Fetch configuration loaded from TOML.
//!
//! ```toml
//! api_key = "..."
//! base_url = "http://127.0.0.1:9000"
//! max_retries = 5
//!
//! [backoff]
//! request_delay_secs = 3
//! rate_limited_secs = 21600
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::error::EngineError;
use crate::retry::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9000";
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Application key sent with every request.
    pub api_key: Option<String>,
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Attempts per logical call, first attempt included.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 60,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl FetchConfig {
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, EngineError> {
        let config: FetchConfig = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("parse config TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.base_url.trim().is_empty() {
            return Err(EngineError::Config("base_url cannot be empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "request_timeout_secs must be positive".into(),
            ));
        }
        self.backoff.validate()
    }
}
