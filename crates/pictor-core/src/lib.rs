//! Generation core
//!
//! Domain types shared by the pictor serving crates: the opaque generation
//! configuration, pipeline signposts, the boundary to the compute
//! collaborator, per-request cancellation and the serialized worker lanes.
//!
//! # Request lifecycle
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌────────┐   ┌─────────┐   ┌──────────┐
//! │ Received │──>│ Resolving   │──>│ Queued │──>│ Running │──>│ Complete │
//! └──────────┘   │ (downloads) │   └────────┘   └─────────┘   └──────────┘
//!                └─────────────┘                     │
//!      CancellationController.register(...) ─────────┘
//! ```

mod cancel;
mod configuration;
mod content;
mod error;
mod generator;
mod queue;
mod signpost;
mod store;

pub use cancel::{CancelAction, CancelSlot, CancellationController, CancellationMonitor};
pub use configuration::{GenerationConfiguration, LoRA};
pub use content::{ContentTable, CONTENT_REFERENCE_LEN};
pub use error::{CoreError, GeneratorError, QueueError, Result};
pub use generator::{
    decode_specifications, ControlHint, DeviceType, GenerationInput, GenerationOutput,
    ImageGenerator, MetadataOverrides, ProgressEvent, Specification,
};
pub use queue::{WorkerLanes, WorkerQueue};
pub use signpost::{text_to_image_signposts, Signpost};
pub use store::{part_path, sha256_file, ModelStore};

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        CancellationController, GenerationConfiguration, GenerationInput, GenerationOutput,
        ImageGenerator, ProgressEvent, Signpost, WorkerLanes,
    };
}
