//! Configuration rewriting seam

use async_trait::async_trait;
use pictor_core::{CancelAction, GenerationConfiguration};

use crate::Result;

/// Progress of the asset downloads behind one rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes of the current asset received
    pub bytes_received: u64,
    /// Size of the current asset, once known
    pub bytes_expected: Option<u64>,
    /// Index of the current asset
    pub index: usize,
    /// Number of assets being fetched
    pub total: usize,
}

/// Registers the cancel action of the phase that is now live
pub type CancelRegistrar = dyn Fn(CancelAction) + Send + Sync;

/// Makes every asset a configuration references available locally.
///
/// Returns a new configuration whose references are the local names.
/// Implementations must be idempotent: rewriting an already-resolved
/// configuration performs no downloads.
#[async_trait]
pub trait ConfigurationRewriter: Send + Sync {
    /// Resolve `configuration`
    async fn rewrite(
        &self,
        configuration: &GenerationConfiguration,
        progress: &mut (dyn FnMut(DownloadProgress) + Send),
        cancellation: &CancelRegistrar,
    ) -> Result<GenerationConfiguration>;
}
