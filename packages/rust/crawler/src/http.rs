//! HTTP + CSS-selector collaborators driven by the `[site]` config section.
//!
//! Each session is its own `reqwest` client with a private cookie jar. Page
//! bodies are kept as strings on the session and parsed on demand, since a
//! parsed `scraper::Html` cannot cross an await point.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};
use url::Url;

use plancrawl_shared::{PageCounts, PlanCrawlError, PlanSummary, Result, SiteConfig};

use crate::collaborators::{Collaborators, Extractor, Navigator, PaginationInfo, SessionProvider};

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// One browsing context: client, cookies, and the page it is on.
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
    results_url: Option<Url>,
    current_url: Option<Url>,
    body: Option<String>,
}

impl HttpSession {
    pub fn current_url(&self) -> Option<&Url> {
        self.current_url.as_ref()
    }

    fn page(&self) -> Result<(&str, &Url)> {
        match (self.body.as_deref(), self.current_url.as_ref()) {
            (Some(body), Some(url)) => Ok((body, url)),
            _ => Err(PlanCrawlError::collaborator("no page loaded in session")),
        }
    }

    /// GET `url` and keep the body. `Ok(false)` for 404/410.
    async fn load(&mut self, url: Url) -> Result<bool> {
        debug!(%url, "fetching page");
        self.body = None;

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| PlanCrawlError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!(%url, status = status.as_u16(), "page not found");
            return Ok(false);
        }
        if !status.is_success() {
            return Err(PlanCrawlError::Network(format!("{url}: HTTP {status}")));
        }

        let final_url = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| PlanCrawlError::Network(format!("{url}: body read failed: {e}")))?;

        self.current_url = Some(final_url);
        self.body = Some(body);
        Ok(true)
    }
}

/// Builds a fresh client per session.
#[derive(Debug, Clone)]
pub struct HttpSessionProvider {
    user_agent: String,
    timeout: Duration,
}

impl HttpSessionProvider {
    pub fn new(site: &SiteConfig) -> Self {
        Self {
            user_agent: site.user_agent.clone(),
            timeout: Duration::from_secs(site.request_timeout_secs),
        }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    type Session = HttpSession;

    async fn acquire(&self) -> Result<HttpSession> {
        let client = Client::builder()
            .user_agent(&self.user_agent)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.timeout)
            .build()
            .map_err(|e| PlanCrawlError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(HttpSession {
            client,
            results_url: None,
            current_url: None,
            body: None,
        })
    }

    async fn release(&self, session: HttpSession) {
        debug!(last_url = ?session.current_url.as_ref().map(Url::as_str), "session released");
    }
}

// ---------------------------------------------------------------------------
// Navigation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpNavigator {
    base: Url,
    results_path: String,
    page_param: String,
}

impl HttpNavigator {
    pub fn new(site: &SiteConfig) -> Result<Self> {
        if !site.results_path.contains("{zipcode}") {
            return Err(PlanCrawlError::config(
                "site.results_path must contain a {zipcode} placeholder",
            ));
        }
        Ok(Self {
            base: site.base()?,
            results_path: site.results_path.clone(),
            page_param: site.page_param.clone(),
        })
    }

    fn results_url(&self, zipcode: &str) -> Result<Url> {
        let path = self.results_path.replace("{zipcode}", zipcode.trim());
        self.base
            .join(&path)
            .map_err(|e| PlanCrawlError::config(format!("invalid results path '{path}': {e}")))
    }

    fn page_url(&self, results: &Url, page: usize) -> Url {
        let kept: Vec<(String, String)> = results
            .query_pairs()
            .filter(|(k, _)| k != self.page_param.as_str())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut url = results.clone();
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (k, v) in &kept {
                query.append_pair(k, v);
            }
            query.append_pair(&self.page_param, &page.to_string());
        }
        url
    }
}

#[async_trait]
impl Navigator<HttpSession> for HttpNavigator {
    #[instrument(skip_all, fields(zipcode = %zipcode))]
    async fn reach_results_view(&self, session: &mut HttpSession, zipcode: &str) -> Result<bool> {
        let url = self.results_url(zipcode)?;
        session.results_url = Some(url.clone());
        session.load(url).await
    }

    async fn next_results_page(&self, session: &mut HttpSession, page: usize) -> Result<bool> {
        let results = session
            .results_url
            .clone()
            .ok_or_else(|| PlanCrawlError::collaborator("results view not open"))?;
        session.load(self.page_url(&results, page)).await
    }

    async fn reach_detail_view(&self, session: &mut HttpSession, location: &str) -> Result<bool> {
        let url = self.base.join(location).map_err(|e| {
            PlanCrawlError::collaborator(format!("invalid detail location '{location}': {e}"))
        })?;
        session.load(url).await
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn selector(css: &str, field: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| PlanCrawlError::config(format!("invalid selector for site.{field} '{css}': {e}")))
}

/// Element text with whitespace collapsed; `None` when empty.
fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(text_of)
}

/// Reads plan cards and detail sections with configured selectors.
#[derive(Debug, Clone)]
pub struct SelectorExtractor {
    card: Selector,
    plan_id_attribute: String,
    name: Selector,
    plan_type: Selector,
    premium: Selector,
    annual_cost: Selector,
    star_rating: Selector,
    details_link: Selector,
    section: Selector,
    heading: Selector,
    title: Selector,
    row: Selector,
    cell: Selector,
}

impl SelectorExtractor {
    pub fn new(site: &SiteConfig) -> Result<Self> {
        Ok(Self {
            card: selector(&site.plan_card_selector, "plan_card_selector")?,
            plan_id_attribute: site.plan_id_attribute.clone(),
            name: selector(&site.plan_name_selector, "plan_name_selector")?,
            plan_type: selector(&site.plan_type_selector, "plan_type_selector")?,
            premium: selector(&site.monthly_premium_selector, "monthly_premium_selector")?,
            annual_cost: selector(&site.annual_cost_selector, "annual_cost_selector")?,
            star_rating: selector(&site.star_rating_selector, "star_rating_selector")?,
            details_link: selector(&site.details_link_selector, "details_link_selector")?,
            section: selector(&site.detail_section_selector, "detail_section_selector")?,
            heading: selector(&site.detail_heading_selector, "detail_heading_selector")?,
            title: selector("h1", "title")?,
            row: selector("tr, dl > div", "row")?,
            cell: selector("th, td, dt, dd", "cell")?,
        })
    }

    pub fn parse_results(&self, body: &str, base: &Url) -> Vec<PlanSummary> {
        let doc = Html::parse_document(body);
        doc.select(&self.card)
            .map(|card| PlanSummary {
                plan_id: card
                    .value()
                    .attr(&self.plan_id_attribute)
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from),
                plan_name: first_text(card, &self.name),
                plan_type: first_text(card, &self.plan_type),
                monthly_premium: first_text(card, &self.premium),
                estimated_annual_cost: first_text(card, &self.annual_cost),
                star_rating: first_text(card, &self.star_rating),
                details_url: card
                    .select(&self.details_link)
                    .next()
                    .and_then(|a| a.value().attr("href"))
                    .and_then(|href| base.join(href).ok())
                    .map(|u| u.to_string()),
            })
            .collect()
    }

    /// `{"url", "title", "sections": {heading: text | {label: value}}}`.
    pub fn parse_details(&self, body: &str, url: &Url) -> Value {
        let doc = Html::parse_document(body);
        let root = doc.root_element();

        let mut sections = Map::new();
        let mut used: HashSet<String> = HashSet::new();
        for (position, section) in doc.select(&self.section).enumerate() {
            let heading = first_text(section, &self.heading)
                .unwrap_or_else(|| format!("section {}", position + 1));
            let mut key = heading.clone();
            let mut n = 2;
            while !used.insert(key.clone()) {
                key = format!("{heading} ({n})");
                n += 1;
            }
            sections.insert(key, self.section_value(section));
        }

        json!({
            "url": url.as_str(),
            "title": first_text(root, &self.title),
            "sections": sections,
        })
    }

    fn section_value(&self, section: ElementRef<'_>) -> Value {
        let mut rows = Map::new();
        for row in section.select(&self.row) {
            let cells: Vec<String> = row.select(&self.cell).filter_map(text_of).collect();
            if let [label, values @ ..] = cells.as_slice() {
                if !values.is_empty() {
                    rows.insert(label.clone(), Value::String(values.join("\n")));
                }
            }
        }
        if !rows.is_empty() {
            return Value::Object(rows);
        }

        let heading = first_text(section, &self.heading);
        let text = text_of(section).map(|t| match &heading {
            Some(h) => t.strip_prefix(h.as_str()).map_or(t.clone(), |rest| rest.trim().to_string()),
            None => t,
        });
        text.map_or(Value::Null, Value::String)
    }
}

#[async_trait]
impl Extractor<HttpSession> for SelectorExtractor {
    async fn read_result_page(&self, session: &mut HttpSession) -> Result<Vec<PlanSummary>> {
        let (body, url) = session.page()?;
        Ok(self.parse_results(body, url))
    }

    async fn read_detail_page(&self, session: &mut HttpSession) -> Result<Value> {
        let (body, url) = session.page()?;
        Ok(self.parse_details(body, url))
    }
}

/// Reads "... of N plans" and derives the page count from the page size.
#[derive(Debug, Clone)]
pub struct SelectorPagination {
    summary: Selector,
    card: Selector,
    number: Regex,
    page_size: usize,
}

impl SelectorPagination {
    pub fn new(site: &SiteConfig) -> Result<Self> {
        if site.page_size == 0 {
            return Err(PlanCrawlError::config("site.page_size must be at least 1"));
        }
        Ok(Self {
            summary: selector(&site.pagination_selector, "pagination_selector")?,
            card: selector(&site.plan_card_selector, "plan_card_selector")?,
            number: Regex::new(r"\d[\d,]*")
                .map_err(|e| PlanCrawlError::config(format!("number pattern: {e}")))?,
            page_size: site.page_size,
        })
    }

    pub fn parse(&self, body: &str) -> PageCounts {
        let doc = Html::parse_document(body);

        let total = doc
            .select(&self.summary)
            .next()
            .and_then(text_of)
            .and_then(|text| {
                self.number
                    .find_iter(&text)
                    .last()
                    .and_then(|m| m.as_str().replace(',', "").parse::<usize>().ok())
            });

        match total {
            Some(item_count) => PageCounts {
                item_count,
                page_count: item_count.div_ceil(self.page_size),
            },
            None => {
                // No summary: everything is on this page.
                let item_count = doc.select(&self.card).count();
                PageCounts {
                    item_count,
                    page_count: usize::from(item_count > 0),
                }
            }
        }
    }
}

#[async_trait]
impl PaginationInfo<HttpSession> for SelectorPagination {
    async fn read(&self, session: &mut HttpSession) -> Result<PageCounts> {
        let (body, _) = session.page()?;
        Ok(self.parse(body))
    }
}

/// Wire the HTTP collaborators from a `[site]` section.
pub fn http_collaborators(site: &SiteConfig) -> Result<Collaborators<HttpSessionProvider>> {
    Ok(Collaborators {
        sessions: std::sync::Arc::new(HttpSessionProvider::new(site)),
        navigator: std::sync::Arc::new(HttpNavigator::new(site)?),
        extractor: std::sync::Arc::new(SelectorExtractor::new(site)?),
        pagination: std::sync::Arc::new(SelectorPagination::new(site)?),
    })
}
