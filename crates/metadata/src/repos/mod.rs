//! Repository traits for coordination state.

pub mod checkpoints;
pub mod copy_jobs;
pub mod dead_letters;
pub mod queue;

pub use checkpoints::CheckpointRepo;
pub use copy_jobs::{CopyJobRepo, PartCompletion};
pub use dead_letters::DeadLetterRepo;
pub use queue::{LeasedItem, QueueRepo};
