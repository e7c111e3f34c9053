//! Remote LoRA resolution

use async_trait::async_trait;
use pictor_core::{GenerationConfiguration, ModelStore};
use pictor_network::{DownloadJob, FetchProgress, NetworkError, ObjectStoreClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::naming::{canonical_name, content_hash};
use crate::{CancelRegistrar, ConfigurationRewriter, DownloadProgress, Result, RewriteError};

/// Fetches content-addressed LoRAs missing from the local store
#[derive(Debug, Clone)]
pub struct LoraLoader {
    client: ObjectStoreClient,
    store: ModelStore,
}

impl LoraLoader {
    /// Create a loader that writes into the store's primary directory
    pub fn new(client: ObjectStoreClient, store: ModelStore) -> Self {
        Self { client, store }
    }

    /// Local store
    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// LoRA references whose content is not stored locally, one per hash
    pub fn missing_assets(&self, configuration: &GenerationConfiguration) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for file in configuration.lora_files() {
            let Some(hash) = content_hash(file) else {
                continue;
            };
            if self.store.is_downloaded(hash) {
                continue;
            }
            if missing.iter().any(|m| canonical_name(m) == hash) {
                continue;
            }
            missing.push(file.to_string());
        }
        missing
    }

    async fn fetch(
        &self,
        name: &str,
        index: usize,
        total: usize,
        progress: &mut (dyn FnMut(DownloadProgress) + Send),
        cancellation: &CancelRegistrar,
    ) -> Result<()> {
        let hash = canonical_name(name);
        info!(lora = name, index, total, "Downloading LoRA");

        match self.download(name, hash, index, total, progress, cancellation).await {
            Ok(()) => return Ok(()),
            Err(NetworkError::Cancelled) => return Err(RewriteError::Cancelled),
            Err(NetworkError::NotFound(_)) => {
                debug!(lora = name, "Key not found, looking for alternatives");
            }
            Err(e) => {
                warn!(lora = name, "Failed to download LoRA: {}", e);
                return Err(RewriteError::CannotLoadModel(name.to_string()));
            }
        }

        let keys = match self.client.list_keys(hash).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix = hash, "Failed to list alternative keys: {}", e);
                return Err(RewriteError::CannotLoadModel(name.to_string()));
            }
        };
        let Some(alternative) = keys
            .into_iter()
            .find(|key| key != name && key.starts_with(hash))
        else {
            warn!(prefix = hash, "No alternative keys found");
            return Err(RewriteError::CannotLoadModel(name.to_string()));
        };

        info!(lora = name, key = %alternative, "Trying alternative key");
        match self
            .download(&alternative, hash, index, total, progress, cancellation)
            .await
        {
            Ok(()) => Ok(()),
            Err(NetworkError::Cancelled) => Err(RewriteError::Cancelled),
            Err(e) => {
                warn!(lora = name, key = %alternative, "Alternative download failed: {}", e);
                Err(RewriteError::CannotLoadModel(name.to_string()))
            }
        }
    }

    async fn download(
        &self,
        key: &str,
        hash: &str,
        index: usize,
        total: usize,
        progress: &mut (dyn FnMut(DownloadProgress) + Send),
        cancellation: &CancelRegistrar,
    ) -> std::result::Result<(), NetworkError> {
        let job = DownloadJob::new(key, self.store.path_for(hash)).with_expected_sha256(hash);

        let token = CancellationToken::new();
        let action_token = token.clone();
        cancellation(Box::new(move || action_token.cancel()));

        let mut report = |p: FetchProgress| {
            progress(DownloadProgress {
                bytes_received: p.bytes_received,
                bytes_expected: p.bytes_expected,
                index,
                total,
            })
        };
        self.client.download(&job, &mut report, &token).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigurationRewriter for LoraLoader {
    async fn rewrite(
        &self,
        configuration: &GenerationConfiguration,
        progress: &mut (dyn FnMut(DownloadProgress) + Send),
        cancellation: &CancelRegistrar,
    ) -> Result<GenerationConfiguration> {
        let missing = self.missing_assets(configuration);
        if missing.is_empty() {
            debug!("All LoRAs available locally");
        } else {
            info!(loras = ?missing, "Fetching missing LoRAs");
        }

        let total = missing.len();
        for (index, name) in missing.iter().enumerate() {
            self.fetch(name, index, total, progress, cancellation).await?;
        }

        Ok(configuration.map_lora_files(|file| canonical_name(file).to_string()))
    }
}
