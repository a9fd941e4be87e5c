use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, ClientBuilder, Proxy};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{BackendKind, FetchBackend, RequestProfile};
use crate::core::errors::map_reqwest_error;
use crate::http::{HttpRequest, HttpResponse};
use crate::proxy::ProxyRef;
use crate::{HarvestError, HarvestResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Customizer = fn(ClientBuilder) -> ClientBuilder;

/// reqwest clients keyed by proxy address; `None` is direct egress.
pub(crate) struct ClientPool {
    timeout: Duration,
    customize: Customizer,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ClientPool {
    /// Builds the direct client eagerly so a broken TLS stack fails here.
    pub(crate) fn new(timeout: Duration, customize: Customizer) -> HarvestResult<Self> {
        let direct = base_builder(timeout, customize)
            .build()
            .map_err(|e| HarvestError::BackendInit(e.to_string()))?;
        let mut clients = HashMap::new();
        clients.insert(None, direct);
        Ok(Self {
            timeout,
            customize,
            clients: Mutex::new(clients),
        })
    }

    pub(crate) async fn client(&self, proxy: Option<&ProxyRef>) -> HarvestResult<Client> {
        let key = proxy.map(|p| p.address.clone());
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = base_builder(self.timeout, self.customize);
        if let Some(address) = &key {
            builder = builder.proxy(Proxy::all(address.as_str())?);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

fn base_builder(timeout: Duration, customize: Customizer) -> ClientBuilder {
    let builder = ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout));
    customize(builder)
}

fn extract_headers(response: &reqwest::Response) -> HashMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.to_string(), val.to_string())))
        .collect()
}

fn extract_set_cookies(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

/// Issues `request` with the profile's headers and cookies on `client`.
pub(crate) async fn send(
    client: &Client,
    request: &HttpRequest,
    profile: &RequestProfile<'_>,
) -> HarvestResult<HttpResponse> {
    let url = request.full_url();
    let mut req = client.get(url.clone());

    for (name, value) in profile.headers(request) {
        let name = header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HarvestError::InvalidHeader(e.to_string()))?;
        let value = header::HeaderValue::from_str(&value)
            .map_err(|e| HarvestError::InvalidHeader(e.to_string()))?;
        req = req.header(name, value);
    }
    if let Some(cookie) = profile.cookies.header_value(&url) {
        req = req.header(header::COOKIE, cookie);
    }

    let timestamp = Utc::now();
    let started = Instant::now();
    let response = req.send().await.map_err(map_reqwest_error)?;

    let status = response.status().as_u16();
    let headers = extract_headers(&response);
    let set_cookies = extract_set_cookies(&response);
    let final_url = response.url().clone();
    let body = response.text().await.map_err(map_reqwest_error)?;

    Ok(HttpResponse {
        url: final_url,
        status,
        headers,
        set_cookies,
        body,
        timestamp,
        elapsed: started.elapsed(),
    })
}

/// reqwest on the platform default TLS stack.
pub struct PlainBackend {
    pool: ClientPool,
    timeout: Duration,
}

impl PlainBackend {
    pub fn new(timeout: Duration) -> HarvestResult<Self> {
        Ok(Self {
            pool: ClientPool::new(timeout, |builder| builder)?,
            timeout,
        })
    }
}

#[async_trait]
impl FetchBackend for PlainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Plain
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
    use crate::http::RequestKind;
    use crate::identity::{BrowserProfile, IdentityGenerator};
    use crate::session::CookieJar;
    use url::Url;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_plain_backend_sends_identity_and_cookies() {
        let server = MockServer::start().await;
        let identity = IdentityGenerator::new().generate_for(BrowserProfile::ChromeWindows);

        Mock::given(method("GET"))
            .and(path("/api/v2/catalog/items"))
            .and(query_param("page", "1"))
            .and(header("cookie", "anon_id=seed"))
            .and(header("x-anon-id", "seed"))
            .and(header_exists("sec-ch-ua"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "session=abc; Path=/")
                    .set_body_string(r#"{"items": []}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = PlainBackend::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/api/v2/catalog/items", server.uri())).unwrap();
        let cookies = CookieJar::new();
        cookies.insert(&url, "anon_id", "seed");
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: vec![("x-anon-id".to_string(), "seed".to_string())],
            overrides: &[],
        };
        let request = HttpRequest::api(url, vec![("page".into(), "1".into())]);

        let response = backend.fetch(&request, &profile).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(request.kind, RequestKind::Api);
        assert_eq!(cookies.get("session").as_deref(), Some("abc"));

        let received = server.received_requests().await.unwrap();
        let user_agent = received[0].headers.get("user-agent").unwrap();
        assert_eq!(user_agent.to_str().unwrap(), identity.user_agent);
    }

    #[tokio::test]
    async fn test_overrides_replace_identity_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("accept-language", "de-DE"))
            .and(header("dnt", "1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let overrides = vec![
            ("Accept-Language".to_string(), "de-DE".to_string()),
            ("dnt".to_string(), "1".to_string()),
        ];
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &overrides,
        };
        let backend = PlainBackend::new(Duration::from_secs(5)).unwrap();
        let request = HttpRequest::navigate(Url::parse(&server.uri()).unwrap());
        assert_eq!(backend.fetch(&request, &profile).await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };
        let backend = PlainBackend::new(Duration::from_millis(100)).unwrap();
        let request = HttpRequest::navigate(Url::parse(&server.uri()).unwrap());
        let err = backend.fetch(&request, &profile).await.unwrap_err();
        assert!(err.is_transient());
    }
}
