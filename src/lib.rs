pub mod archive;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod print;

pub use archive::{ArchiveMover, MoveOutcome};
pub use classifier::{Classification, FileClassifier};
pub use config::{ServiceConfig, WatchMode};
pub use crate::core::{FileReport, PrintStatus, ShutdownHandle, SupervisorState, WatchSupervisor};
pub use error::{ConfigError, InitError, PrintJobFailure, StrategyFailure};
pub use print::{PrintJob, PrintQueue, PrintType, StrategyChain};
