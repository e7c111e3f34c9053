//! Object store configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default signing region for R2-style stores
pub const DEFAULT_REGION: &str = "auto";

/// Retry configuration
///
/// Resumes wait a fixed delay; there is no exponential growth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failures without progress before giving up
    pub max_retries: u32,
    /// Delay before each resume
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Object store client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Endpoint base URL, e.g. `https://<account>.r2.cloudflarestorage.com`
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Access key id
    pub access_key: String,
    /// Secret access key
    #[serde(skip_serializing)]
    pub secret_key: String,
    /// Signing region
    pub region: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Minimum delay between progress updates
    pub progress_interval: Duration,
    /// User agent string
    pub user_agent: String,
    /// Retry configuration
    pub retry: RetryConfig,
}

impl ObjectStoreConfig {
    /// Create a configuration for a bucket
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: DEFAULT_REGION.to_string(),
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_millis(250),
            user_agent: format!("pictor-network/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryConfig::default(),
        }
    }

    /// Set signing region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry configuration
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set progress interval
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ObjectStoreConfig::new("https://example.com/", "models", "ak", "sk");
        assert_eq!(config.endpoint, "https://example.com");
        assert_eq!(config.region, "auto");
        assert_eq!(config.retry.backoff, Duration::from_millis(200));
        assert_eq!(config.progress_interval, Duration::from_millis(250));
    }
}
