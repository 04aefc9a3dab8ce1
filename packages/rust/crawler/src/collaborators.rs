//! Narrow interfaces to the page-driving world.
//!
//! The orchestrator never touches a page directly: it reaches views through a
//! [`Navigator`], reads them through an [`Extractor`] and [`PaginationInfo`],
//! and borrows sessions from a [`SessionProvider`]. Every interface is generic
//! over the session type so a browser driver, an HTTP client or a test fake
//! can stand behind it.

use std::sync::Arc;

use async_trait::async_trait;
use plancrawl_shared::{PageCounts, PlanSummary, Result};

/// Hands out and takes back sessions (browser pages, HTTP clients, ...).
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn acquire(&self) -> Result<Self::Session>;

    /// Return a session. Must not fail; implementations log and drop.
    async fn release(&self, session: Self::Session);
}

/// Moves a session between views. `Ok(false)` means the view could not be
/// reached (for example a missing page) without a transport failure.
#[async_trait]
pub trait Navigator<S: Send>: Send + Sync {
    /// Open the results listing for a zipcode, positioned on page 1.
    async fn reach_results_view(&self, session: &mut S, zipcode: &str) -> Result<bool>;

    /// Advance the open results listing to `page` (1-based).
    async fn next_results_page(&self, session: &mut S, page: usize) -> Result<bool>;

    /// Open a plan detail page.
    async fn reach_detail_view(&self, session: &mut S, location: &str) -> Result<bool>;
}

/// Reads structured data from the view a session is on.
#[async_trait]
pub trait Extractor<S: Send>: Send + Sync {
    async fn read_result_page(&self, session: &mut S) -> Result<Vec<PlanSummary>>;

    /// Opaque detail payload for the current plan page.
    async fn read_detail_page(&self, session: &mut S) -> Result<serde_json::Value>;
}

#[async_trait]
pub trait PaginationInfo<S: Send>: Send + Sync {
    async fn read(&self, session: &mut S) -> Result<PageCounts>;
}

/// Every collaborator a crawl needs, bound to one session type.
pub struct Collaborators<P: SessionProvider> {
    pub sessions: Arc<P>,
    pub navigator: Arc<dyn Navigator<P::Session>>,
    pub extractor: Arc<dyn Extractor<P::Session>>,
    pub pagination: Arc<dyn PaginationInfo<P::Session>>,
}

impl<P: SessionProvider> Clone for Collaborators<P> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            navigator: Arc::clone(&self.navigator),
            extractor: Arc::clone(&self.extractor),
            pagination: Arc::clone(&self.pagination),
        }
    }
}
