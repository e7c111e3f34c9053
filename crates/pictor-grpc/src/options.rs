//! Runtime switches shared by the service handlers.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, ServiceError};

/// Service-wide options, adjustable while the server runs
#[derive(Debug, Default)]
pub struct ServiceOptions {
    shared_secret: Option<String>,
    response_compression: AtomicBool,
    enable_model_browsing: AtomicBool,
    echo_on_queue: AtomicBool,
}

impl ServiceOptions {
    /// Options with no secret and everything switched off
    pub fn new() -> Self {
        Self::default()
    }

    /// Require this secret on every request; an empty secret disables the check
    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.shared_secret = (!secret.is_empty()).then_some(secret);
        self
    }

    /// Whether a shared secret is configured
    pub fn requires_secret(&self) -> bool {
        self.shared_secret.is_some()
    }

    /// Validate the secret a request carried
    pub fn check_secret(&self, provided: Option<&str>) -> Result<()> {
        match self.shared_secret {
            Some(ref expected) if provided != Some(expected.as_str()) => {
                Err(ServiceError::Unauthenticated)
            }
            _ => Ok(()),
        }
    }

    /// Whether generated tensors and previews are zlib-compressed
    pub fn response_compression(&self) -> bool {
        self.response_compression.load(Ordering::Relaxed)
    }

    /// Switch response compression for subsequent messages
    pub fn set_response_compression(&self, enabled: bool) {
        self.response_compression.store(enabled, Ordering::Relaxed);
    }

    /// Whether echo lists the available models
    pub fn enable_model_browsing(&self) -> bool {
        self.enable_model_browsing.load(Ordering::Relaxed)
    }

    /// Switch model browsing in echo replies
    pub fn set_enable_model_browsing(&self, enabled: bool) {
        self.enable_model_browsing.store(enabled, Ordering::Relaxed);
    }

    /// Whether echo replies are built on the active worker lane
    pub fn echo_on_queue(&self) -> bool {
        self.echo_on_queue.load(Ordering::Relaxed)
    }

    /// Switch whether echo runs on the active worker lane
    pub fn set_echo_on_queue(&self, enabled: bool) {
        self.echo_on_queue.store(enabled, Ordering::Relaxed);
    }
}
