//! Printing
//!
//! Jobs flow from the classifier into a [`PrintQueue`], whose single worker
//! hands each one to a [`StrategyChain`] of external print mechanisms.

pub mod chain;
pub mod job;
pub mod queue;
pub mod render;
pub mod strategy;
pub mod verify;

pub use chain::{PrintSuccess, StrategyChain, StrategyChainBuilder};
pub use job::{DocumentKind, PrintJob, PrintType};
pub use queue::{PrintOutcome, PrintQueue, PrintTicket};
pub use render::TextRenderStrategy;
pub use strategy::{ExternalCommandStrategy, PrintStrategy};
pub use verify::{CommandVerifier, PrintVerifier, ProbeCommand};
