use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use super::{BackendKind, FetchBackend, RequestProfile};
use crate::core::config::SiteConfig;
use crate::http::{HttpRequest, HttpResponse, RequestKind};
use crate::identity::Identity;
use crate::proxy::ProxyRef;
use crate::{HarvestError, HarvestResult};

/// What a browser context hands back for a navigation or in-page fetch.
#[derive(Debug, Clone, Default)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
}

/// One isolated browser context (own cookies, own proxy).
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn navigate(&self, url: &Url) -> HarvestResult<PageResponse>;

    /// `fetch()` issued from the currently loaded document.
    async fn fetch_in_page(
        &self,
        url: &Url,
        headers: &[(String, String)],
        referrer: Option<&Url>,
    ) -> HarvestResult<PageResponse>;

    async fn cookies(&self) -> HarvestResult<Vec<(String, String)>>;

    async fn is_alive(&self) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_context(
        &self,
        identity: &Identity,
        proxy: Option<&ProxyRef>,
    ) -> HarvestResult<Box<dyn BrowserContext>>;

    async fn shutdown(&self) {}
}

// Headers the page cannot set itself or that the browser already sends.
fn settable_in_page(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    !(name.starts_with("sec-")
        || matches!(
            name.as_str(),
            "user-agent" | "accept-encoding" | "referer" | "cookie" | "upgrade-insecure-requests"
        ))
}

/// The listing a referer points at, without the per-request `time` and
/// `page` parameters.
fn listing_key(referer: &Url) -> Url {
    let pairs: Vec<(String, String)> = referer
        .query_pairs()
        .filter(|(name, _)| name != "time" && name != "page")
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    let mut key = referer.clone();
    key.set_query(None);
    if !pairs.is_empty() {
        key.query_pairs_mut().extend_pairs(pairs);
    }
    key
}

#[derive(Default)]
struct ContextSlot {
    context: Option<Box<dyn BrowserContext>>,
    proxy: Option<String>,
    requests: usize,
    primed: bool,
    /// Listing page the current document was loaded from, if any.
    listing: Option<Url>,
}

/// Runs requests inside a real browser. The context is warmed up once per
/// lifetime and recycled after `max_requests`, on proxy change, or when dead.
pub struct BrowserBackend {
    driver: Arc<dyn BrowserDriver>,
    site: SiteConfig,
    timeout: Duration,
    max_requests: usize,
    slot: Mutex<ContextSlot>,
}

impl BrowserBackend {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        site: SiteConfig,
        timeout: Duration,
        max_requests: usize,
    ) -> Self {
        Self {
            driver,
            site,
            timeout,
            max_requests: max_requests.max(1),
            slot: Mutex::new(ContextSlot::default()),
        }
    }

    async fn needs_recycle(&self, slot: &ContextSlot, proxy: Option<&ProxyRef>) -> bool {
        let Some(context) = &slot.context else {
            return true;
        };
        if slot.requests >= self.max_requests {
            debug!("Browser context served {} requests, recycling", slot.requests);
            return true;
        }
        if slot.proxy.as_deref() != proxy.map(|p| p.address.as_str()) {
            debug!("Proxy changed, recycling browser context");
            return true;
        }
        if !context.is_alive().await {
            warn!("Browser context died, recycling");
            return true;
        }
        false
    }

    /// Idempotent warm-up: home, catalog, then the listing page of `referer`.
    pub async fn ensure_primed(
        &self,
        profile: &RequestProfile<'_>,
        referer: Option<&Url>,
    ) -> HarvestResult<()> {
        let mut slot = self.slot.lock().await;

        if self.needs_recycle(&slot, profile.proxy).await {
            if let Some(old) = slot.context.take() {
                old.close().await;
            }
            let context = self.driver.new_context(profile.identity, profile.proxy).await?;
            *slot = ContextSlot {
                context: Some(context),
                proxy: profile.proxy.map(|p| p.address.clone()),
                requests: 0,
                primed: false,
                listing: None,
            };
        }
        let wanted = referer.map(listing_key);
        let needs_listing = wanted.is_some() && slot.listing != wanted;
        if slot.primed && !needs_listing {
            return Ok(());
        }

        let context = slot
            .context
            .as_ref()
            .ok_or_else(|| HarvestError::Browser("no browser context".into()))?;
        let home = self.site.home_url()?;

        if !slot.primed {
            let landing = context.navigate(&home).await?;
            if landing.status >= 400 {
                return Err(HarvestError::Browser(format!(
                    "home page answered {} during warm-up",
                    landing.status
                )));
            }
            let catalog = self.site.catalog_url()?;
            if let Err(e) = context.navigate(&catalog).await {
                warn!("Catalog warm-up failed: {}", e);
            }
        }
        let mut listing_loaded = slot.listing.clone();
        if let Some(listing) = wanted.filter(|_| needs_listing) {
            listing_loaded = None;
            match context.navigate(&listing).await {
                Ok(_) => listing_loaded = Some(listing),
                Err(e) => warn!("Listing warm-up failed: {}", e),
            }
        }

        for (name, value) in context.cookies().await? {
            profile.cookies.insert(&home, &name, &value);
        }
        if !slot.primed {
            info!("Browser context primed ({} cookies)", profile.cookies.len());
        }
        slot.primed = true;
        slot.listing = listing_loaded;
        Ok(())
    }
}

#[async_trait]
impl FetchBackend for BrowserBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Browser
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn prepare(&self, request: &HttpRequest, profile: &RequestProfile<'_>) -> HarvestResult<()> {
        let referer = match request.kind {
            RequestKind::Api => request.referer.as_ref(),
            RequestKind::Navigate => None,
        };
        self.ensure_primed(profile, referer).await
    }

    async fn fetch_raw(
        &self,
        request: &HttpRequest,
        profile: &RequestProfile<'_>,
    ) -> HarvestResult<HttpResponse> {
        let mut slot = self.slot.lock().await;
        if request.kind == RequestKind::Navigate {
            slot.listing = None;
        }
        let context = slot
            .context
            .as_ref()
            .ok_or_else(|| HarvestError::Browser("browser context not primed".into()))?;

        let url = request.full_url();
        let timestamp = Utc::now();
        let started = Instant::now();
        let page = match request.kind {
            RequestKind::Navigate => context.navigate(&url).await?,
            RequestKind::Api => {
                let headers: Vec<(String, String)> = profile
                    .headers(request)
                    .into_iter()
                    .filter(|(name, _)| settable_in_page(name))
                    .collect();
                context
                    .fetch_in_page(&url, &headers, request.referer.as_ref())
                    .await?
            }
        };
        let elapsed = started.elapsed();

        for (name, value) in context.cookies().await? {
            profile.cookies.insert(&url, &name, &value);
        }
        slot.requests += 1;

        Ok(HttpResponse {
            url,
            status: page.status,
            headers: page.headers,
            set_cookies: Vec::new(),
            body: page.body,
            timestamp,
            elapsed,
        })
    }

    async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(context) = slot.context.take() {
            context.close().await;
        }
        slot.primed = false;
        slot.listing = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityGenerator;
    use crate::session::CookieJar;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        navigations: SyncMutex<Vec<String>>,
        fetch_headers: SyncMutex<Vec<Vec<(String, String)>>>,
        contexts: AtomicUsize,
        closed: AtomicUsize,
        dead: AtomicBool,
    }

    struct FakeContext(Arc<Recorder>);

    #[async_trait]
    impl BrowserContext for FakeContext {
        async fn navigate(&self, url: &Url) -> HarvestResult<PageResponse> {
            self.0.navigations.lock().push(url.to_string());
            Ok(PageResponse {
                status: 200,
                body: "<html></html>".into(),
                headers: HashMap::new(),
            })
        }

        async fn fetch_in_page(
            &self,
            _url: &Url,
            headers: &[(String, String)],
            _referrer: Option<&Url>,
        ) -> HarvestResult<PageResponse> {
            self.0.fetch_headers.lock().push(headers.to_vec());
            Ok(PageResponse {
                status: 200,
                body: r#"{"items": []}"#.into(),
                headers: HashMap::new(),
            })
        }

        async fn cookies(&self) -> HarvestResult<Vec<(String, String)>> {
            Ok(vec![("anon_id".into(), "from-browser".into())])
        }

        async fn is_alive(&self) -> bool {
            !self.0.dead.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.0.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeDriver(Arc<Recorder>);

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn new_context(
            &self,
            _identity: &Identity,
            _proxy: Option<&ProxyRef>,
        ) -> HarvestResult<Box<dyn BrowserContext>> {
            self.0.contexts.fetch_add(1, Ordering::SeqCst);
            self.0.dead.store(false, Ordering::SeqCst);
            Ok(Box::new(FakeContext(self.0.clone())))
        }
    }

    fn backend(max_requests: usize) -> (BrowserBackend, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let site = SiteConfig::default().with_base_url("http://site.test/");
        let backend = BrowserBackend::new(
            Arc::new(FakeDriver(recorder.clone())),
            site,
            Duration::from_secs(5),
            max_requests,
        );
        (backend, recorder)
    }

    const LISTING_221: &str = "http://site.test/catalog?catalog[]=221&brand_ids[]=115";
    const LISTING_1206: &str = "http://site.test/catalog?catalog[]=1206&brand_ids[]=115";

    fn api_request_for(listing: &str) -> HttpRequest {
        HttpRequest::api(Url::parse("http://site.test/api/v2/catalog/items").unwrap(), vec![])
            .with_referer(Url::parse(listing).unwrap())
    }

    fn api_request() -> HttpRequest {
        api_request_for(LISTING_221)
    }

    fn url_string(raw: &str) -> String {
        Url::parse(raw).unwrap().to_string()
    }

    fn listing(raw: &str) -> String {
        listing_key(&Url::parse(raw).unwrap()).to_string()
    }

    #[tokio::test]
    async fn test_warm_up_runs_once_per_context() {
        let (backend, recorder) = backend(10);
        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: vec![("x-anon-id".into(), "abc".into())],
            overrides: &[],
        };

        backend.fetch(&api_request(), &profile).await.unwrap();
        backend.fetch(&api_request(), &profile).await.unwrap();

        assert_eq!(
            *recorder.navigations.lock(),
            vec![
                url_string("http://site.test/"),
                url_string("http://site.test/catalog"),
                listing(LISTING_221),
            ]
        );
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 1);
        assert_eq!(cookies.get("anon_id").as_deref(), Some("from-browser"));

        let headers = recorder.fetch_headers.lock();
        assert!(headers[0].iter().any(|(k, _)| k == "x-anon-id"));
        assert!(!headers[0].iter().any(|(k, _)| k == "user-agent" || k.starts_with("sec-")));
    }

    #[tokio::test]
    async fn test_listing_visited_after_page_load_and_per_category() {
        let (backend, recorder) = backend(10);
        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };

        let home = HttpRequest::navigate(Url::parse("http://site.test/").unwrap());
        backend.fetch(&home, &profile).await.unwrap();
        backend.fetch(&api_request_for(LISTING_221), &profile).await.unwrap();
        let next_page = format!("{}&page=1&time=1700000000", LISTING_221);
        backend.fetch(&api_request_for(&next_page), &profile).await.unwrap();
        backend.fetch(&api_request_for(LISTING_1206), &profile).await.unwrap();

        assert_eq!(
            *recorder.navigations.lock(),
            vec![
                url_string("http://site.test/"),
                url_string("http://site.test/catalog"),
                url_string("http://site.test/"),
                listing(LISTING_221),
                listing(LISTING_1206),
            ]
        );
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listing_key_ignores_time_and_page() {
        let a = Url::parse("http://site.test/catalog?time=1&catalog[]=221&page=2&brand_ids[]=115").unwrap();
        let b = Url::parse("http://site.test/catalog?time=9&catalog[]=221&brand_ids[]=115").unwrap();
        assert_eq!(listing_key(&a), listing_key(&b));
        assert!(!listing_key(&a).as_str().contains("time="));
    }

    #[tokio::test]
    async fn test_context_recycled_after_request_budget_and_death() {
        let (backend, recorder) = backend(2);
        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };

        for _ in 0..3 {
            backend.fetch(&api_request(), &profile).await.unwrap();
        }
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 1);

        recorder.dead.store(true, Ordering::SeqCst);
        backend.fetch(&api_request(), &profile).await.unwrap();
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_context_recycled_on_proxy_change() {
        let (backend, recorder) = backend(100);
        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let proxy = ProxyRef {
            address: "http://10.0.0.1:3128".into(),
            validated_at: Instant::now(),
            ttl: Duration::from_secs(300),
        };

        let direct = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };
        backend.fetch(&api_request(), &direct).await.unwrap();

        let proxied = RequestProfile {
            identity: &identity,
            proxy: Some(&proxy),
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };
        backend.fetch(&api_request(), &proxied).await.unwrap();
        assert_eq!(recorder.contexts.load(Ordering::SeqCst), 2);

        backend.shutdown().await;
        assert_eq!(recorder.closed.load(Ordering::SeqCst), 2);
    }
}
