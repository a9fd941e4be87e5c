use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::core::config::{SiteConfig, TraversalMode};
use crate::taxonomy::{CategoryId, SourceId};
use crate::HarvestResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Top-level page load (warm-up, cookie refresh).
    Navigate,
    /// XHR-style JSON call.
    Api,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub params: Vec<(String, String)>,
    pub referer: Option<Url>,
    pub kind: RequestKind,
    pub page: Option<u32>,
}

impl HttpRequest {
    pub fn navigate(url: Url) -> Self {
        Self {
            url,
            params: Vec::new(),
            referer: None,
            kind: RequestKind::Navigate,
            page: None,
        }
    }

    pub fn api(url: Url, params: Vec<(String, String)>) -> Self {
        Self {
            url,
            params,
            referer: None,
            kind: RequestKind::Api,
            page: None,
        }
    }

    pub fn with_referer(mut self, referer: Url) -> Self {
        self.referer = Some(referer);
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The URL with its query parameters applied.
    pub fn full_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }
        url
    }
}

/// Strictly increasing unix-seconds token for the `time` query parameter.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Builds catalog API requests and their listing-page referers.
#[derive(Debug)]
pub struct CatalogRequestBuilder {
    site: SiteConfig,
    clock: MonotonicClock,
}

impl CatalogRequestBuilder {
    pub fn new(site: SiteConfig) -> Self {
        Self {
            site,
            clock: MonotonicClock::new(),
        }
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    pub fn page_request(
        &self,
        source: &SourceId,
        category: CategoryId,
        page: u32,
        mode: TraversalMode,
    ) -> HarvestResult<HttpRequest> {
        let time = self.clock.next();
        let params = vec![
            ("page".to_string(), page.to_string()),
            ("per_page".to_string(), self.site.page_size.to_string()),
            ("time".to_string(), time.to_string()),
            ("search_text".to_string(), String::new()),
            ("catalog_ids".to_string(), category.to_string()),
            ("order".to_string(), self.site.order_for(mode).to_string()),
            ("catalog_from".to_string(), "0".to_string()),
            ("size_ids".to_string(), String::new()),
            ("brand_ids".to_string(), source.to_string()),
            ("status_ids".to_string(), String::new()),
            ("color_ids".to_string(), String::new()),
            ("material_ids".to_string(), String::new()),
        ];

        let previous_page = if page > 1 { Some(page - 1) } else { None };
        let referer = self.listing_url(source, category, previous_page, Some(time))?;

        Ok(HttpRequest::api(self.site.api_url()?, params)
            .with_referer(referer)
            .with_page(page))
    }

    /// The category/brand listing page a browser would have been on.
    pub fn listing_url(
        &self,
        source: &SourceId,
        category: CategoryId,
        page: Option<u32>,
        time: Option<u64>,
    ) -> HarvestResult<Url> {
        let mut url = self.site.catalog_url()?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(time) = time {
                query.append_pair("time", &time.to_string());
            }
            query.append_pair("catalog[]", &category.to_string());
            query.append_pair("catalog_from", "0");
            if let Some(page) = page {
                query.append_pair("page", &page.to_string());
            }
            query.append_pair("brand_ids[]", source.as_str());
        }
        Ok(url)
    }
}
