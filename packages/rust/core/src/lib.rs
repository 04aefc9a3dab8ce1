//! Crawl orchestration for plancrawl.
//!
//! Ties the state store, the persistence actor and the worker pools together
//! into end-to-end runs (see [`pipeline::run_crawl`]), and exposes the
//! progress and shutdown seams the CLI plugs into.

pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod shutdown;

pub use pipeline::{RunSummary, StatusCounts, StatusReport, crawl_status, export_state, run_crawl};
pub use progress::{Eta, EtaTracker, ProgressReporter, ProgressUpdate, SilentProgress};
pub use scheduler::{PhaseReport, Scheduler};
pub use shutdown::ShutdownCoordinator;
