//! Application configuration for plancrawl.
//!
//! User config lives at `~/.plancrawl/plancrawl.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlanCrawlError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "plancrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".plancrawl";

// ---------------------------------------------------------------------------
// Config structs (matching plancrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Retry, timeout, pacing and persistence knobs.
    #[serde(default)]
    pub crawl: CrawlPoliciesConfig,

    /// Catalog site layout used by the HTTP collaborators.
    #[serde(default)]
    pub site: SiteConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding the state file and every export.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Concurrent worker slots per phase.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            workers: default_workers(),
        }
    }
}

fn default_output_dir() -> String {
    "final_output".into()
}
fn default_workers() -> usize {
    4
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPoliciesConfig {
    /// Attempts per task before it is reported as terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Hard wall-clock budget of a single attempt.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Pause before each task starts, to keep load on the site low.
    #[serde(default = "default_pacing")]
    pub pacing_ms: u64,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Window in which save requests collapse into one flush.
    #[serde(default = "default_save_debounce")]
    pub save_debounce_ms: u64,

    /// How long in-flight tasks may keep running after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for CrawlPoliciesConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            task_timeout_secs: default_task_timeout(),
            pacing_ms: default_pacing(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            save_debounce_ms: default_save_debounce(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_task_timeout() -> u64 {
    120
}
fn default_pacing() -> u64 {
    500
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_max() -> u64 {
    30_000
}
fn default_save_debounce() -> u64 {
    1_000
}
fn default_shutdown_grace() -> u64 {
    10
}

/// `[site]` section: where the catalog lives and how its pages are shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Scheme + host of the catalog.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Results path template; `{zipcode}` is substituted.
    #[serde(default = "default_results_path")]
    pub results_path: String,

    /// Query parameter selecting a result page.
    #[serde(default = "default_page_param")]
    pub page_param: String,

    /// Plans shown per result page, used when only a total is printed.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Element wrapping one plan on a result page.
    #[serde(default = "default_plan_card")]
    pub plan_card_selector: String,

    /// Attribute on the plan card carrying a stable plan id.
    #[serde(default = "default_plan_id_attribute")]
    pub plan_id_attribute: String,

    #[serde(default = "default_plan_name")]
    pub plan_name_selector: String,

    #[serde(default = "default_plan_type")]
    pub plan_type_selector: String,

    #[serde(default = "default_premium")]
    pub monthly_premium_selector: String,

    #[serde(default = "default_annual_cost")]
    pub annual_cost_selector: String,

    #[serde(default = "default_star_rating")]
    pub star_rating_selector: String,

    /// Link inside the card pointing at the plan detail page.
    #[serde(default = "default_details_link")]
    pub details_link_selector: String,

    /// Element whose text holds "... of N plans".
    #[serde(default = "default_pagination")]
    pub pagination_selector: String,

    /// Section of the detail page; each becomes one key of the payload.
    #[serde(default = "default_detail_section")]
    pub detail_section_selector: String,

    /// Heading inside a detail section.
    #[serde(default = "default_detail_heading")]
    pub detail_heading_selector: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            results_path: default_results_path(),
            page_param: default_page_param(),
            page_size: default_page_size(),
            plan_card_selector: default_plan_card(),
            plan_id_attribute: default_plan_id_attribute(),
            plan_name_selector: default_plan_name(),
            plan_type_selector: default_plan_type(),
            monthly_premium_selector: default_premium(),
            annual_cost_selector: default_annual_cost(),
            star_rating_selector: default_star_rating(),
            details_link_selector: default_details_link(),
            pagination_selector: default_pagination(),
            detail_section_selector: default_detail_section(),
            detail_heading_selector: default_detail_heading(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.medicare.gov".into()
}
fn default_results_path() -> String {
    "/plan-compare/search-results?zip={zipcode}".into()
}
fn default_page_param() -> String {
    "page".into()
}
fn default_page_size() -> usize {
    10
}
fn default_plan_card() -> String {
    ".plan-card".into()
}
fn default_plan_id_attribute() -> String {
    "data-plan-id".into()
}
fn default_plan_name() -> String {
    ".plan-name".into()
}
fn default_plan_type() -> String {
    ".plan-type".into()
}
fn default_premium() -> String {
    ".monthly-premium".into()
}
fn default_annual_cost() -> String {
    ".estimated-annual-cost".into()
}
fn default_star_rating() -> String {
    ".star-rating".into()
}
fn default_details_link() -> String {
    "a.plan-details".into()
}
fn default_pagination() -> String {
    ".pagination-summary".into()
}
fn default_detail_section() -> String {
    "section".into()
}
fn default_detail_heading() -> String {
    "h2".into()
}
fn default_user_agent() -> String {
    concat!("plancrawl/", env!("CARGO_PKG_VERSION")).into()
}
fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Crawl config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Directory for state and exports.
    pub output_dir: PathBuf,
    /// Worker slots per phase.
    pub workers: usize,
    /// Only the first `limit` input rows are crawled.
    pub limit: Option<usize>,
    /// Archive existing artifacts and start over.
    pub reset: bool,
    pub max_attempts: u32,
    pub task_timeout: Duration,
    pub pacing: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub save_debounce: Duration,
    pub shutdown_grace: Duration,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        let crawl = &config.crawl;
        Self {
            output_dir: PathBuf::from(&config.defaults.output_dir),
            workers: config.defaults.workers,
            limit: None,
            reset: false,
            max_attempts: crawl.max_attempts,
            task_timeout: Duration::from_secs(crawl.task_timeout_secs),
            pacing: Duration::from_millis(crawl.pacing_ms),
            backoff_base: Duration::from_millis(crawl.backoff_base_ms),
            backoff_max: Duration::from_millis(crawl.backoff_max_ms),
            save_debounce: Duration::from_millis(crawl.save_debounce_ms),
            shutdown_grace: Duration::from_secs(crawl.shutdown_grace_secs),
        }
    }
}

impl CrawlConfig {
    /// Reject values that would stall or spin the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PlanCrawlError::config("workers must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(PlanCrawlError::config("max_attempts must be at least 1"));
        }
        if self.task_timeout.is_zero() {
            return Err(PlanCrawlError::config("task_timeout_secs must be positive"));
        }
        Ok(())
    }
}

impl SiteConfig {
    /// Parse `base_url`, failing with a config error instead of at first request.
    pub fn base(&self) -> Result<url::Url> {
        url::Url::parse(&self.base_url).map_err(|e| {
            PlanCrawlError::config(format!("invalid site.base_url '{}': {e}", self.base_url))
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.plancrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PlanCrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.plancrawl/plancrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PlanCrawlError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        PlanCrawlError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PlanCrawlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PlanCrawlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PlanCrawlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
