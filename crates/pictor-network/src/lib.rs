//! Signed object-storage downloads
//!
//! Fetches model assets from an S3-compatible bucket (R2 in production)
//! with:
//!
//! - **SigV4 signing**: header-based, region `auto` by default
//! - **Resume**: interrupted transfers continue with `Range: bytes=N-`
//! - **Fixed backoff**: 200 ms between attempts
//! - **Throttled progress**: at most one update per 250 ms
//! - **Cancellation**: partial files are removed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ DownloadJob  │──>│ ObjectStore  │──>│ <dest>.part      │
//! │ key, dest,   │   │ Client       │   │  (append, resume)│
//! │ size, sha256 │   │  sign + GET  │   └────────┬─────────┘
//! └──────────────┘   └──────┬───────┘            │ verify
//!                           │ FetchProgress      ↓ rename
//!                           ↓                ┌────────┐
//!                      progress cb           │ <dest> │
//!                                            └────────┘
//! ```

mod client;
mod config;
mod error;
mod signing;

pub use client::{DownloadJob, DownloadTask, FetchProgress, ObjectStoreClient};
pub use config::{ObjectStoreConfig, RetryConfig, DEFAULT_REGION};
pub use error::{NetworkError, Result};
pub use signing::{uri_encode_path, uri_encode_value, RequestSigner, SignedHeaders};

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        DownloadJob, FetchProgress, NetworkError, ObjectStoreClient, ObjectStoreConfig, Result,
    };
}
