use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::core::retry::RetryPolicy;
use crate::scrapers::BackendKind;
use crate::HarvestResult;

const DEFAULT_BASE_URL: &str = "https://www.vinted.fr/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraversalMode {
    /// Every page until an empty page or the page cap.
    Exhaustive,
    /// Stop at the item recorded as most recent by the previous pass.
    Delta,
}

/// Uniformly sampled pause between `min` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            return Self { min: max, max: min };
        }
        Self { min, max }
    }

    pub fn from_secs(min: u64, max: u64) -> Self {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }

    pub fn from_millis(min: u64, max: u64) -> Self {
        Self::new(Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn zero() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Where and how the marketplace API is addressed.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub base_url: String,
    pub api_path: String,
    pub catalog_path: String,
    pub page_size: u32,
    pub default_order: String,
    pub delta_order: String,
    pub items_field: String,
    pub accept_language: String,
    /// Cookie carrying the anonymous visitor id, mirrored into `anon_header`.
    pub anon_cookie: Option<String>,
    pub anon_header: Option<String>,
    /// Header used to send the CSRF token scraped during warm-up.
    pub csrf_header: Option<String>,
    pub api_headers: Vec<(String, String)>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_path: "/api/v2/catalog/items".to_string(),
            catalog_path: "/catalog".to_string(),
            page_size: 96,
            default_order: "relevance".to_string(),
            delta_order: "newest_first".to_string(),
            items_field: "items".to_string(),
            accept_language: "fr-FR,fr;q=0.9,en;q=0.8".to_string(),
            anon_cookie: Some("anon_id".to_string()),
            anon_header: Some("x-anon-id".to_string()),
            csrf_header: Some("x-csrf-token".to_string()),
            api_headers: vec![("x-money-object".to_string(), "true".to_string())],
        }
    }
}

impl SiteConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn base(&self) -> HarvestResult<Url> {
        Ok(Url::parse(&self.base_url)?)
    }

    pub fn home_url(&self) -> HarvestResult<Url> {
        self.base()
    }

    pub fn catalog_url(&self) -> HarvestResult<Url> {
        Ok(self.base()?.join(&self.catalog_path)?)
    }

    pub fn api_url(&self) -> HarvestResult<Url> {
        Ok(self.base()?.join(&self.api_path)?)
    }

    pub fn order_for(&self, mode: TraversalMode) -> &str {
        match mode {
            TraversalMode::Exhaustive => &self.default_order,
            TraversalMode::Delta => &self.delta_order,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub site: SiteConfig,
    pub mode: TraversalMode,
    pub page_cap: u32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub page_delay: DelayRange,
    pub category_delay: DelayRange,
    pub warmup_delay: DelayRange,
    pub workers: usize,
    pub max_session_attempts: usize,
    /// Session strategies in fallback order.
    pub strategies: Vec<BackendKind>,
    pub resume: bool,
    pub browser_requests_per_context: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            mode: TraversalMode::Exhaustive,
            page_cap: 10,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            page_delay: DelayRange::from_secs(1, 3),
            category_delay: DelayRange::from_secs(2, 5),
            warmup_delay: DelayRange::from_secs(1, 3),
            workers: 1,
            max_session_attempts: 5,
            strategies: vec![BackendKind::TlsMimic, BackendKind::Browser, BackendKind::Plain],
            resume: true,
            browser_requests_per_context: 200,
        }
    }
}

impl HarvestConfig {
    pub fn with_site(mut self, site: SiteConfig) -> Self {
        self.site = site;
        self
    }

    pub fn with_mode(mut self, mode: TraversalMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_page_cap(mut self, page_cap: u32) -> Self {
        self.page_cap = page_cap.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_delays(mut self, page: DelayRange, category: DelayRange, warmup: DelayRange) -> Self {
        self.page_delay = page;
        self.category_delay = category;
        self.warmup_delay = warmup;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_session_attempts(mut self, attempts: usize) -> Self {
        self.max_session_attempts = attempts.max(1);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<BackendKind>) -> Self {
        if !strategies.is_empty() {
            self.strategies = strategies;
        }
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// No pauses anywhere; for tests and local dry runs.
    pub fn without_delays(self) -> Self {
        let retry = RetryPolicy {
            page_budget: self.retry.page_budget,
            consecutive_failure_threshold: self.retry.consecutive_failure_threshold,
            max_session_failures: self.retry.max_session_failures,
            block_conditions: self.retry.block_conditions.clone(),
            ..RetryPolicy::immediate()
        };
        self.with_retry(retry)
            .with_delays(DelayRange::zero(), DelayRange::zero(), DelayRange::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_range_sampling_stays_in_bounds() {
        let range = DelayRange::from_millis(10, 20);
        for _ in 0..100 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(DelayRange::zero().sample(), Duration::ZERO);
        assert_eq!(DelayRange::from_secs(5, 1).min, Duration::from_secs(1));
    }

    #[test]
    fn test_site_urls() {
        let site = SiteConfig::default().with_base_url("http://127.0.0.1:8080/");
        assert_eq!(site.home_url().unwrap().as_str(), "http://127.0.0.1:8080/");
        assert_eq!(site.catalog_url().unwrap().as_str(), "http://127.0.0.1:8080/catalog");
        assert_eq!(
            site.api_url().unwrap().as_str(),
            "http://127.0.0.1:8080/api/v2/catalog/items"
        );
        assert_eq!(site.order_for(TraversalMode::Delta), "newest_first");
    }

    #[test]
    fn test_without_delays_keeps_bounds() {
        let config = HarvestConfig::default().without_delays();
        assert_eq!(config.retry.page_budget, 3);
        assert!(config.page_delay.is_zero());
        assert_eq!(config.retry.rate_limit.initial_delay, Duration::ZERO);
        assert_eq!(config.strategies.first(), Some(&BackendKind::TlsMimic));
    }
}
