//! Core functionality module
//!
//! Contains directory watching, de-duplication and the per-file pipeline

pub mod identity;
pub mod pipeline;
pub mod watcher;

// Re-export main types
pub use identity::{SeenFiles, SeenRegistry, WatchedFile};
pub use pipeline::{Arrival, FileProcessor, FileReport, Pipeline, Prepared, PrintStatus};
pub use watcher::{ShutdownHandle, SupervisorState, WatchSupervisor};
