//! Generation configuration rewriting
//!
//! Before a request is queued its configuration may reference assets that
//! are not on local disk yet. A [`ConfigurationRewriter`] fetches them and
//! hands back a configuration that only uses local names.
//!
//! ```text
//! loras: ["<sha256>_<uuid>", "detail_tweaker"]
//!            │                    │ not content-addressed, untouched
//!            ↓ missing locally?
//!       GET <bucket>/<sha256>_<uuid>  ──404──> list <sha256>* ──> retry
//!            ↓ verify sha256
//! loras: ["<sha256>", "detail_tweaker"]
//! ```

mod error;
mod loader;
pub mod naming;
mod rewriter;

pub use error::{Result, RewriteError};
pub use loader::LoraLoader;
pub use naming::{canonical_name, is_content_addressed};
pub use rewriter::{CancelRegistrar, ConfigurationRewriter, DownloadProgress};
