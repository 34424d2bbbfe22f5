//! Checkpoint lifecycle for the training driver
//!
//! - [`CheckpointStore`]: atomic local publish and restore of checkpoint slots
//! - [`RemoteSync`]: mirrors committed checkpoints to an object store
//! - [`PushWorker`]: background, latest-wins push queue

pub mod pusher;
pub mod store;
pub mod sync;

pub use pusher::{PushJob, PushStatus, PushWorker};
pub use store::{AuxiliaryArtifact, CheckpointHandle, CheckpointStore};
pub use sync::{PushOutcome, RemoteSync};
