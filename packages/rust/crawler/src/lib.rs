//! Work execution for plancrawl.
//!
//! - [`collaborators`]: the navigation/extraction/session traits the
//!   orchestrator depends on
//! - [`pool`]: bounded-concurrency task runner with retries and timeouts
//! - [`backoff`]: retry delays
//! - [`http`]: `reqwest` + `scraper` implementation of the collaborators

pub mod backoff;
pub mod collaborators;
pub mod http;
pub mod pool;

pub use backoff::Backoff;
pub use collaborators::{Collaborators, Extractor, Navigator, PaginationInfo, SessionProvider};
pub use http::{
    HttpNavigator, HttpSession, HttpSessionProvider, SelectorExtractor, SelectorPagination,
    http_collaborators,
};
pub use pool::{PoolConfig, PoolReport, TaskOutcome, TaskRunner, WorkerPool};
