//! Durable storage of the crawl state on the local filesystem.
//!
//! - [`atomic`] replaces files via temp-then-rename with a `.backup` copy
//! - [`writer`] is the single, debounced writer actor for an output directory
//! - [`recovery`] loads the best available state at startup and archives
//!   artifacts on `--reset`
//!
//! Nothing else in the workspace writes into the output directory.

pub mod atomic;
pub mod paths;
pub mod recovery;
pub mod writer;

pub use atomic::{restore_backup_if_missing, write_atomic};
pub use paths::{DETAIL_FILE, RECORDS_FILE, STATE_FILE, SUMMARY_FILE, StatePaths};
pub use recovery::{Recovered, RecoverySource, load_state, reconstruct, reset_artifacts};
pub use writer::{StateWriter, WriterStats, persist_snapshot, write_exports};
