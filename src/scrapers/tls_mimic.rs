use async_trait::async_trait;
use reqwest::ClientBuilder;
use std::time::Duration;

use super::http_scraper::{send, ClientPool};
use super::{BackendKind, FetchBackend, RequestProfile};
use crate::http::{HttpRequest, HttpResponse};
use crate::HarvestResult;

// HTTP/2 SETTINGS advertised by desktop Chrome.
const CHROME_STREAM_WINDOW: u32 = 6 * 1024 * 1024;
const CHROME_CONNECTION_WINDOW: u32 = 15 * 1024 * 1024;

fn chrome_like(builder: ClientBuilder) -> ClientBuilder {
    builder
        .use_rustls_tls()
        .http2_initial_stream_window_size(CHROME_STREAM_WINDOW)
        .http2_initial_connection_window_size(CHROME_CONNECTION_WINDOW)
        .http2_adaptive_window(false)
}

/// reqwest on rustls with browser-like HTTP/2 settings. Construction fails
/// when the TLS stack cannot be initialized; callers fall back to Plain.
pub struct TlsMimicBackend {
    pool: ClientPool,
    timeout: Duration,
}

impl TlsMimicBackend {
    pub fn new(timeout: Duration) -> HarvestResult<Self> {
        Ok(Self {
            pool: ClientPool::new(timeout, chrome_like)?,
            timeout,
        })
    }
}

#[async_trait]
impl FetchBackend for TlsMimicBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::TlsMimic
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_raw(
        &self,
        request: &HttpRequest,
        profile: &RequestProfile<'_>,
    ) -> HarvestResult<HttpResponse> {
        let client = self.pool.client(profile.proxy).await?;
        send(&client, request, profile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityGenerator;
    use crate::session::CookieJar;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_tls_mimic_fetches_over_http1() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let backend = TlsMimicBackend::new(Duration::from_secs(5)).unwrap();
        assert_eq!(backend.kind(), BackendKind::TlsMimic);

        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };
        let request = HttpRequest::navigate(Url::parse(&server.uri()).unwrap());
        let response = backend.fetch(&request, &profile).await.unwrap();
        assert_eq!(response.body, "<html></html>");
    }
}
