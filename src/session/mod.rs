mod cookies;

pub use cookies::CookieJar;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::config::{DelayRange, HarvestConfig, SiteConfig};
use crate::http::{HttpRequest, HttpResponse};
use crate::identity::{Identity, IdentityGenerator};
use crate::proxy::{ProxyHandle, ProxyRef};
use crate::scrapers::{
    BackendKind, BrowserBackend, BrowserDriver, FetchBackend, PlainBackend, RequestProfile,
    TlsMimicBackend,
};
use crate::stats::StatsTracker;
use crate::{HarvestError, HarvestResult};

/// Builds transports for the session strategies.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, kind: BackendKind) -> HarvestResult<Box<dyn FetchBackend>>;

    fn supports(&self, _kind: BackendKind) -> bool {
        true
    }
}

/// Real transports. The browser strategy is only offered with a driver.
pub struct ReqwestBackendFactory {
    site: SiteConfig,
    timeout: Duration,
    browser: Option<Arc<dyn BrowserDriver>>,
    browser_requests_per_context: usize,
}

impl ReqwestBackendFactory {
    pub fn new(config: &HarvestConfig) -> Self {
        Self {
            site: config.site.clone(),
            timeout: config.request_timeout,
            browser: None,
            browser_requests_per_context: config.browser_requests_per_context,
        }
    }

    pub fn with_browser(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.browser = Some(driver);
        self
    }
}

#[async_trait]
impl BackendFactory for ReqwestBackendFactory {
    async fn create(&self, kind: BackendKind) -> HarvestResult<Box<dyn FetchBackend>> {
        match kind {
            BackendKind::Plain => Ok(Box::new(PlainBackend::new(self.timeout)?)),
            BackendKind::TlsMimic => match TlsMimicBackend::new(self.timeout) {
                Ok(backend) => Ok(Box::new(backend)),
                Err(e) => {
                    warn!("TLS-mimicking transport unavailable ({}), using plain", e);
                    Ok(Box::new(PlainBackend::new(self.timeout)?))
                }
            },
            BackendKind::Browser => {
                let driver = self.browser.clone().ok_or_else(|| {
                    HarvestError::BackendInit("no browser driver configured".into())
                })?;
                Ok(Box::new(BrowserBackend::new(
                    driver,
                    self.site.clone(),
                    self.timeout,
                    self.browser_requests_per_context,
                )))
            }
        }
    }

    fn supports(&self, kind: BackendKind) -> bool {
        kind != BackendKind::Browser || self.browser.is_some()
    }
}

/// One worker's client state: transport, fingerprint, egress and cookies.
pub struct Session {
    pub id: Uuid,
    pub identity: Identity,
    pub proxy: Option<ProxyRef>,
    pub backend: Box<dyn FetchBackend>,
    pub cookies: CookieJar,
    /// Anti-bot tokens scraped during warm-up, e.g. `csrf`.
    pub tokens: HashMap<String, String>,
    pub overrides: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
    site: Arc<SiteConfig>,
    stats: StatsTracker,
}

impl Session {
    pub fn new(
        identity: Identity,
        proxy: Option<ProxyRef>,
        backend: Box<dyn FetchBackend>,
        site: Arc<SiteConfig>,
        stats: StatsTracker,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            proxy,
            backend,
            cookies: CookieJar::new(),
            tokens: HashMap::new(),
            overrides: Vec::new(),
            created_at: Utc::now(),
            site,
            stats,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn site(&self) -> &SiteConfig {
        &self.site
    }

    /// The visitor id the site issued, or the identity's seed before it did.
    pub fn anon_id(&self) -> String {
        self.site
            .anon_cookie
            .as_deref()
            .and_then(|name| self.cookies.get(name))
            .unwrap_or_else(|| self.identity.cookie_seed.clone())
    }

    pub fn profile(&self) -> RequestProfile<'_> {
        let mut api_headers = self.site.api_headers.clone();
        if let Some(header) = &self.site.anon_header {
            api_headers.push((header.clone(), self.anon_id()));
        }
        if let (Some(header), Some(token)) = (&self.site.csrf_header, self.tokens.get("csrf")) {
            api_headers.push((header.clone(), token.clone()));
        }
        RequestProfile {
            identity: &self.identity,
            proxy: self.proxy.as_ref(),
            cookies: &self.cookies,
            api_headers,
            overrides: &self.overrides,
        }
    }

    pub async fn fetch(&self, request: &HttpRequest) -> HarvestResult<HttpResponse> {
        let profile = self.profile();
        match self.backend.fetch(request, &profile).await {
            Ok(response) => {
                self.stats
                    .record_request(response.status, response.body.len(), response.elapsed);
                Ok(response)
            }
            Err(e) => {
                if e.is_transient() {
                    self.stats.record_transport_error();
                }
                Err(e)
            }
        }
    }

    pub async fn close(&self) {
        self.backend.shutdown().await;
    }
}

/// Pulls anti-bot tokens out of a landing page.
fn extract_tokens(html: &str) -> HashMap<String, String> {
    let mut tokens = HashMap::new();
    let document = Html::parse_document(html);
    if let Ok(selector) = Selector::parse(r#"meta[name="csrf-token"]"#) {
        if let Some(token) = document
            .select(&selector)
            .next()
            .and_then(|meta| meta.value().attr("content"))
            .filter(|t| !t.is_empty())
        {
            tokens.insert("csrf".to_string(), token.to_string());
        }
    }
    tokens
}

/// Creates, warms up, mutates and replaces sessions for one worker.
pub struct SessionSupervisor {
    config: Arc<HarvestConfig>,
    site: Arc<SiteConfig>,
    identities: IdentityGenerator,
    factory: Arc<dyn BackendFactory>,
    proxies: ProxyHandle,
    stats: StatsTracker,
}

impl SessionSupervisor {
    pub fn new(
        config: Arc<HarvestConfig>,
        identities: IdentityGenerator,
        factory: Arc<dyn BackendFactory>,
        proxies: ProxyHandle,
        stats: StatsTracker,
    ) -> Self {
        let site = Arc::new(config.site.clone());
        Self {
            config,
            site,
            identities,
            factory,
            proxies,
            stats,
        }
    }

    pub fn proxies(&self) -> &ProxyHandle {
        &self.proxies
    }

    /// Strategy for the n-th attempt; the last one repeats.
    fn strategy_for(&self, attempt: usize) -> BackendKind {
        let available: Vec<BackendKind> = self
            .config
            .strategies
            .iter()
            .copied()
            .filter(|kind| self.factory.supports(*kind))
            .collect();
        match available.len() {
            0 => BackendKind::Plain,
            n => available[attempt.min(n - 1)],
        }
    }

    pub async fn create_session(&self) -> Option<Session> {
        self.create(false).await
    }

    /// Discards the old session (identity, cookies, transport) and builds a new one.
    pub async fn rebuild(&self, old: Session) -> Option<Session> {
        info!("Rebuilding session {} ({})", old.id, old.backend_kind());
        old.close().await;
        drop(old);
        self.create(true).await
    }

    async fn create(&self, rebuild: bool) -> Option<Session> {
        let attempts = self.config.max_session_attempts;
        for attempt in 0..attempts {
            if attempt > 0 {
                pause(self.config.warmup_delay).await;
            }
            let kind = self.strategy_for(attempt);
            let backend = match self.factory.create(kind).await {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("Session attempt {}/{}: {} unavailable: {}", attempt + 1, attempts, kind, e);
                    continue;
                }
            };

            let identity = self.identities.generate();
            let proxy = self.proxies.get_working(false).await;
            info!(
                "Session attempt {}/{}: {} as {} via {}",
                attempt + 1,
                attempts,
                backend.kind(),
                identity.profile,
                proxy.as_ref().map(|p| p.redacted()).unwrap_or_else(|| "direct".into())
            );
            let mut session = Session::new(
                identity,
                proxy,
                backend,
                Arc::clone(&self.site),
                self.stats.clone(),
            );

            match self.warm_up(&mut session).await {
                Ok(()) => {
                    self.stats.record_session(rebuild);
                    info!("Session {} established ({})", session.id, session.backend_kind());
                    return Some(session);
                }
                Err(status) => {
                    if status == Some(403) {
                        self.proxies.invalidate().await;
                    }
                    session.close().await;
                }
            }
        }
        error!("Failed to create a session after {} attempts", attempts);
        None
    }

    /// Home page must answer 200; the catalog visit is best effort.
    /// On failure returns the status seen, if any.
    async fn warm_up(&self, session: &mut Session) -> Result<(), Option<u16>> {
        let home = self.site.home_url().map_err(|_| None)?;
        let landing = match session.fetch(&HttpRequest::navigate(home)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Home page probe failed: {}", e);
                return Err(None);
            }
        };
        if landing.status != 200 {
            warn!("Home page probe answered {}", landing.status);
            return Err(Some(landing.status));
        }
        session.tokens.extend(extract_tokens(&landing.body));

        pause(self.config.warmup_delay).await;
        self.visit_catalog(session).await;
        Ok(())
    }

    async fn visit_catalog(&self, session: &Session) {
        let catalog = match self.site.catalog_url() {
            Ok(url) => url,
            Err(e) => {
                warn!("Bad catalog URL: {}", e);
                return;
            }
        };
        match session.fetch(&HttpRequest::navigate(catalog)).await {
            Ok(response) if response.status == 200 => debug!("Catalog warm-up done"),
            Ok(response) => warn!("Catalog warm-up answered {}", response.status),
            Err(e) => warn!("Catalog warm-up failed: {}", e),
        }
    }

    /// Re-visits home and catalog to pick up fresh cookies.
    pub async fn refresh_cookies(&self, session: &Session) -> HarvestResult<()> {
        let home = session.fetch(&HttpRequest::navigate(self.site.home_url()?)).await?;
        debug!("Cookie refresh: home answered {}", home.status);
        self.visit_catalog(session).await;
        Ok(())
    }

    /// First ladder step: drop the current proxy and take another one.
    pub async fn rotate_proxy(&self, session: &mut Session) {
        self.proxies.invalidate().await;
        let next = self.proxies.get_working(true).await;
        match &next {
            Some(proxy) => info!("Rotated to proxy {}", proxy.redacted()),
            None => info!("No alternative proxy, continuing direct"),
        }
        session.proxy = next;
    }

    /// Second ladder step: new fingerprint, empty cookie jar, shuffled
    /// request-pattern headers.
    pub async fn rotate_identity(&self, session: &mut Session) {
        let identity = self.identities.generate();
        info!("Rotating identity to {}", identity.profile);
        session.identity = identity;
        session.cookies.clear();
        session.overrides = self.identities.noise_headers();
        session.backend.shutdown().await;
    }
}

async fn pause(range: DelayRange) {
    let delay = range.sample();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests;
