use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::errors::TransportKind;
use crate::http::{HttpRequest, HttpResponse, RequestKind};
use crate::identity::Identity;
use crate::proxy::ProxyRef;
use crate::session::CookieJar;
use crate::{HarvestError, HarvestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Plain,
    TlsMimic,
    Browser,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Plain => "plain",
            BackendKind::TlsMimic => "tls-mimic",
            BackendKind::Browser => "browser",
        };
        f.write_str(name)
    }
}

/// Everything a backend needs to present a session on one request.
pub struct RequestProfile<'a> {
    pub identity: &'a Identity,
    pub proxy: Option<&'a ProxyRef>,
    pub cookies: &'a CookieJar,
    /// Site headers for API calls: visitor id, CSRF token and the like.
    pub api_headers: Vec<(String, String)>,
    /// Applied last; replace headers of the same name.
    pub overrides: &'a [(String, String)],
}

impl RequestProfile<'_> {
    /// Final ordered header list, without `Cookie`.
    pub fn headers(&self, request: &HttpRequest) -> Vec<(String, String)> {
        let mut headers = self.identity.headers_for(request.kind);
        if let Some(referer) = &request.referer {
            headers.push(("referer".to_string(), referer.to_string()));
        }
        if request.kind == RequestKind::Api {
            headers.extend(self.api_headers.iter().cloned());
        }
        for (name, value) in self.overrides {
            match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some(existing) => existing.1 = value.clone(),
                None => headers.push((name.clone(), value.clone())),
            }
        }
        headers
    }
}

/// A transport strategy. Implementations only issue the request; the
/// provided `fetch` adds the deadline and cookie bookkeeping.
#[async_trait]
pub trait FetchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn timeout(&self) -> Duration;

    async fn fetch_raw(
        &self,
        request: &HttpRequest,
        profile: &RequestProfile<'_>,
    ) -> HarvestResult<HttpResponse>;

    /// Work that must happen before requests and is not bound by the
    /// per-request deadline (browser warm-up).
    async fn prepare(&self, _request: &HttpRequest, _profile: &RequestProfile<'_>) -> HarvestResult<()> {
        Ok(())
    }

    async fn fetch(
        &self,
        request: &HttpRequest,
        profile: &RequestProfile<'_>,
    ) -> HarvestResult<HttpResponse> {
        self.prepare(request, profile).await?;

        let deadline = self.timeout();
        let response = match tokio::time::timeout(deadline, self.fetch_raw(request, profile)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(HarvestError::transport(
                    TransportKind::Timeout,
                    format!("{} backend exceeded {:?}", self.kind(), deadline),
                ))
            }
        };

        debug!(
            "{} {} -> {} ({} bytes, {:?})",
            self.kind(),
            request.url,
            response.status,
            response.body.len(),
            response.elapsed
        );
        profile.cookies.absorb(&response.url, &response.set_cookies);
        Ok(response)
    }

    async fn shutdown(&self) {}
}
