//! Server configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pictor_core::{CancellationMonitor, ModelStore};
use pictor_network::ObjectStoreConfig;
use thiserror::Error;

use crate::tls::{TlsConfig, TlsResult};

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory models are read from and uploaded to
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Additional model directory; downloaded LoRAs land here
    pub secondary_models_dir: Option<PathBuf>,

    /// Secret every request must carry
    pub shared_secret: Option<String>,

    /// Enable TLS when a certificate and key are configured
    #[serde(default = "default_tls_enabled")]
    pub tls_enabled: bool,

    /// Path to TLS certificate
    pub tls_cert: Option<String>,

    /// Path to TLS key
    pub tls_key: Option<String>,

    /// Path to client CA certificate (for mTLS)
    pub tls_client_ca: Option<String>,

    /// Require client certificates (mTLS)
    #[serde(default)]
    pub tls_require_client_cert: bool,

    /// Compress generated tensors and previews
    #[serde(default)]
    pub response_compression: bool,

    /// Let echo list available models
    #[serde(default)]
    pub model_browsing: bool,

    /// Build echo replies on the active worker lane
    #[serde(default)]
    pub echo_on_queue: bool,

    /// Route new work to the backup lane at startup
    #[serde(default)]
    pub uses_backup_queue: bool,

    /// Object storage access key id
    pub blob_store_access_key: Option<String>,

    /// Object storage secret access key
    pub blob_store_secret: Option<String>,

    /// Object storage endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`
    pub blob_store_endpoint: Option<String>,

    /// Bucket holding uploaded LoRAs
    pub blob_store_bucket: Option<String>,

    /// Seconds a cancelled request may run before a warning
    pub cancellation_warning_timeout_secs: Option<u64>,

    /// Further seconds before the process is terminated
    pub cancellation_crash_timeout_secs: Option<u64>,

    /// Terminate the process when a cancelled request never returns
    #[serde(default = "default_cancellation_crash")]
    pub cancellation_crash: bool,

    /// Maximum message size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            models_dir: default_models_dir(),
            secondary_models_dir: None,
            shared_secret: None,
            tls_enabled: default_tls_enabled(),
            tls_cert: None,
            tls_key: None,
            tls_client_ca: None,
            tls_require_client_cert: false,
            response_compression: false,
            model_browsing: false,
            echo_on_queue: false,
            uses_backup_queue: false,
            blob_store_access_key: None,
            blob_store_secret: None,
            blob_store_endpoint: None,
            blob_store_bucket: None,
            cancellation_warning_timeout_secs: None,
            cancellation_crash_timeout_secs: None,
            cancellation_crash: default_cancellation_crash(),
            max_message_size: default_max_message_size(),
            metrics_enabled: default_metrics_enabled(),
            metrics_port: default_metrics_port(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load a TOML configuration file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Build a TLS configuration from this server config.
    ///
    /// Returns None if TLS is not enabled or required paths are missing.
    pub fn build_tls_config(&self) -> Option<TlsResult<TlsConfig>> {
        if !self.tls_enabled {
            return None;
        }

        let cert_path = self.tls_cert.as_ref()?;
        let key_path = self.tls_key.as_ref()?;

        let mut config = match TlsConfig::from_pem(Path::new(cert_path), Path::new(key_path)) {
            Ok(c) => c,
            Err(e) => return Some(Err(e)),
        };

        if let Some(ref client_ca_path) = self.tls_client_ca {
            config = match config.with_client_ca(Path::new(client_ca_path)) {
                Ok(c) => c,
                Err(e) => return Some(Err(e)),
            };
        }

        config = config.require_client_cert(self.tls_require_client_cert);

        Some(Ok(config))
    }

    /// Model directories searched by the service, primary first
    pub fn model_store(&self) -> ModelStore {
        let store = ModelStore::new(&self.models_dir);
        match self.secondary_models_dir {
            Some(ref secondary) => store.with_directory(secondary),
            None => store,
        }
    }

    /// Store LoRA downloads are written into
    pub fn lora_store(&self) -> Option<ModelStore> {
        let secondary = self.secondary_models_dir.as_ref()?;
        Some(ModelStore::new(secondary).with_directory(&self.models_dir))
    }

    /// Object storage settings, when every blob-store option and a
    /// secondary models directory are given
    pub fn object_store_config(&self) -> Option<ObjectStoreConfig> {
        self.secondary_models_dir.as_ref()?;
        Some(ObjectStoreConfig::new(
            self.blob_store_endpoint.as_deref()?,
            self.blob_store_bucket.as_deref()?,
            self.blob_store_access_key.as_deref()?,
            self.blob_store_secret.as_deref()?,
        ))
    }

    /// Watchdog for cancelled requests, when both timeouts are given
    pub fn cancellation_monitor(&self) -> Option<CancellationMonitor> {
        let warning = self.cancellation_warning_timeout_secs?;
        let crash = self.cancellation_crash_timeout_secs?;
        let monitor =
            CancellationMonitor::new(Duration::from_secs(warning), Duration::from_secs(crash));
        Some(if self.cancellation_crash {
            monitor
        } else {
            monitor.log_only()
        })
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7859
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_tls_enabled() -> bool {
    true
}

fn default_cancellation_crash() -> bool {
    true
}

fn default_max_message_size() -> usize {
    1024 * 1024 * 1024 // 1GB
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}
