//! Pictor gRPC Image Generation Service
//!
//! Serves image generation to clients on the network. Requests are checked
//! against a shared secret, their LoRAs resolved from object storage when
//! needed, and run one at a time on a worker lane while progress, previews
//! and results stream back.
//!
//! ## RPCs
//!
//! - `GenerateImage`: stream download progress, signposts, previews and
//!   (optionally chunked) results
//! - `FilesExist`: existence and SHA-256 of model files
//! - `UploadFile`: offset-checked, hash-verified model uploads
//! - `Echo`: connectivity check with optional model browsing
//!
//! ## Usage
//!
//! ```bash
//! pictor-server /srv/models --port 7859 --shared-secret s3cret \
//!     --tls-cert cert.pem --tls-key key.pem
//! ```

pub mod proto {
    tonic::include_proto!("pictor.imageservice.v1");
}

pub mod compression;
pub mod config;
pub mod convert;
pub mod delegate;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod options;
pub mod service;
pub mod tls;
pub mod upload;

pub use config::{ConfigError, ServerConfig};
pub use delegate::{DelegateDispatcher, GenerationServiceDelegate};
pub use error::{Result, ServiceError};
pub use handler::{GenerationRequestHandler, Outcome, CHUNK_SIZE};
pub use options::ServiceOptions;
pub use service::{ImageGenerationServiceImpl, ServiceBuilder};
pub use tls::{TlsConfig, TlsError, TlsResult};
