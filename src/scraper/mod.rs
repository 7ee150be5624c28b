// src/scraper/mod.rs
//
// C-Scraper contract (spec §6): every source site plugs in through this
// trait. Downstream (C1-C7) code only ever sees `RawListing`, never a
// site-specific shape.

mod error;
mod homes;
mod suumo;

pub use error::ScraperError;
pub use homes::HomesScraper;
pub use suumo::SuumoScraper;

use crate::domain::{RawListing, SourceSite};
use crate::errors::Result;
use crate::orchestrator::task::ResumeState;

/// Per-call knobs a scraper must honor (spec §6: "force_detail_fetch",
/// "max_properties").
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeFlags {
    pub force_detail_fetch: bool,
}

/// A single source's plugin contract. Implementations own their own
/// HTTP client and resume-state cell; the orchestrator calls
/// `resume_state`/`set_resume_state` around pause/resume boundaries
/// (spec §4.7.4) and never reaches into scraper internals otherwise.
pub trait Scraper: Send + Sync {
    fn name(&self) -> &'static str;
    fn source_site(&self) -> SourceSite;

    /// Scrapes one area, yielding up to `max_properties` raw listings.
    /// Each item is independently fallible so one bad listing doesn't
    /// abort the whole page (spec §6 "Failure isolation").
    fn scrape_area(
        &self,
        area_code: &str,
        max_properties: i64,
        flags: ScrapeFlags,
    ) -> Result<Box<dyn Iterator<Item = Result<RawListing>> + Send>>;

    fn resume_state(&self) -> Option<ResumeState>;
    fn set_resume_state(&self, state: Option<ResumeState>);
}

/// Builds the standard blocking HTTP client shared by the site plugins
/// (spec §6: "a realistic User-Agent, bounded timeout").
pub fn build_client() -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36")
        .timeout(std::time::Duration::from_secs(30))
        .build()
}
