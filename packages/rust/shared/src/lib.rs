//! Shared types, error model, configuration and state store for plancrawl.
//!
//! This crate is the foundation depended on by all other plancrawl crates.
//! It provides:
//! - [`PlanCrawlError`]: the unified error type
//! - Domain types ([`CrawlState`], [`ZipcodeEntry`], [`PlanEntry`], statuses)
//! - State transitions ([`state`]) and the shared [`CrawlStore`] handle
//! - Configuration ([`AppConfig`], [`CrawlConfig`], config loading)

pub mod config;
pub mod error;
pub mod state;
pub mod store;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, CrawlPoliciesConfig, DefaultsConfig, SiteConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{PlanCrawlError, Result};
pub use state::{PendingCounts, PlanApplied};
pub use store::CrawlStore;
pub use types::{
    CURRENT_SCHEMA_VERSION, CrawlMetadata, CrawlState, PageCounts, Phase, PlanEntry, PlanStatus,
    PlanSummary, PlanTask, ZipcodeEntry, ZipcodeInput, ZipcodeStatus,
};
