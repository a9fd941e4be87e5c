use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, ClientBuilder, Proxy};
use std::time::Duration;
use url::Url;

use crate::core::errors::map_reqwest_error;
use crate::{HarvestError, HarvestResult};

pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Somewhere proxy candidates come from.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;
    async fn candidates(&self) -> HarvestResult<Vec<String>>;
}

/// Cheap liveness check for one candidate.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    async fn probe(&self, address: &str) -> bool;

    /// Whether the site is reachable without any proxy.
    async fn probe_direct(&self) -> bool {
        false
    }
}

/// Accepts `host:port`, `user:pass@host:port` or a full proxy URL.
pub fn normalize_proxy(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    match Url::parse(&candidate) {
        Ok(url) if url.host_str().is_some() => Some(candidate),
        _ => {
            debug!("Ignoring unparsable proxy entry");
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticProxySource {
    proxies: Vec<String>,
}

impl StaticProxySource {
    pub fn new<I, S>(proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            proxies: proxies
                .into_iter()
                .filter_map(|p| normalize_proxy(p.as_ref()))
                .collect(),
        }
    }

    /// Comma or whitespace separated list, e.g. from `HARVEST_PROXIES`.
    pub fn from_list(list: &str) -> Self {
        Self::new(list.split(|c: char| c == ',' || c.is_whitespace()))
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[async_trait]
impl ProxySource for StaticProxySource {
    fn name(&self) -> &str {
        "static"
    }

    async fn candidates(&self) -> HarvestResult<Vec<String>> {
        Ok(self.proxies.clone())
    }
}

/// Plain-text list served over HTTP, one proxy per line.
#[derive(Debug, Clone)]
pub struct RemoteProxyList {
    url: Url,
    client: Client,
}

impl RemoteProxyList {
    pub fn new(url: Url, timeout: Duration) -> HarvestResult<Self> {
        let client = ClientBuilder::new().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ProxySource for RemoteProxyList {
    fn name(&self) -> &str {
        "remote"
    }

    async fn candidates(&self) -> HarvestResult<Vec<String>> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(HarvestError::transport(
                crate::core::errors::TransportKind::Other,
                format!("proxy list answered {}", response.status()),
            ));
        }
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(body.lines().filter_map(normalize_proxy).collect())
    }
}

/// Probes through the candidate against a neutral URL, never the target site.
#[derive(Debug, Clone)]
pub struct HttpProber {
    probe_url: Url,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(probe_url: Url, timeout: Duration) -> Self {
        Self { probe_url, timeout }
    }

    pub fn with_defaults() -> HarvestResult<Self> {
        Ok(Self::new(Url::parse(DEFAULT_PROBE_URL)?, Duration::from_secs(10)))
    }

    async fn check(&self, builder: ClientBuilder, via: &str) -> bool {
        let client = match builder.timeout(self.timeout).build() {
            Ok(client) => client,
            Err(_) => return false,
        };
        match client.get(self.probe_url.clone()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Probe via {} failed: {}", via, e);
                false
            }
        }
    }
}

#[async_trait]
impl ProxyProber for HttpProber {
    async fn probe(&self, address: &str) -> bool {
        let proxy = match Proxy::all(address) {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!("Invalid proxy {}: {}", super::redact(address), e);
                return false;
            }
        };
        self.check(ClientBuilder::new().proxy(proxy), &super::redact(address))
            .await
    }

    async fn probe_direct(&self) -> bool {
        self.check(ClientBuilder::new().no_proxy(), "direct").await
    }
}
