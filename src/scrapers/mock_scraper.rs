use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use url::Url;

use super::{BackendKind, FetchBackend, RequestProfile};
use crate::core::errors::TransportKind;
use crate::http::{HttpRequest, HttpResponse, RequestKind};
use crate::session::BackendFactory;
use crate::taxonomy::CategoryId;
use crate::{HarvestError, HarvestResult};

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub set_cookies: Vec<String>,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: Vec::new(),
            set_cookies: Vec::new(),
            delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::new(status, "")
    }

    pub fn items(ids: &[u64]) -> Self {
        let items: Vec<_> = ids
            .iter()
            .map(|id| json!({"id": id, "title": format!("item {}", id)}))
            .collect();
        Self::new(200, json!({ "items": items }).to_string())
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn with_cookie(mut self, set_cookie: &str) -> Self {
        self.set_cookies.push(set_cookie.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(MockResponse),
    Fail(TransportKind),
}

impl From<MockResponse> for MockReply {
    fn from(response: MockResponse) -> Self {
        MockReply::Respond(response)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub backend: BackendKind,
    pub kind: RequestKind,
    pub url: Url,
    pub page: Option<u32>,
    pub category: Option<CategoryId>,
    pub proxy: Option<String>,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub cookie: Option<String>,
    pub at: Instant,
}

#[derive(Default)]
struct MockState {
    listings: HashMap<CategoryId, Vec<u64>>,
    scripted: HashMap<(CategoryId, u32), VecDeque<MockReply>>,
    navigation: VecDeque<MockReply>,
    failing_kinds: Vec<BackendKind>,
    requests: Vec<RecordedRequest>,
}

/// Scripted backend. Catalog pages come from per-(category, page) scripts
/// first, then from a generated listing; navigations answer 200 unless
/// scripted. Clones share state, so a factory can hand out copies and the
/// test still sees every request.
#[derive(Clone)]
pub struct MockBackend {
    kind: BackendKind,
    timeout: Duration,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            kind: BackendKind::Plain,
            timeout: Duration::from_secs(30),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Same scripted state presented as another backend kind.
    pub fn as_kind(&self, kind: BackendKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Items of `category` in listing order, paged by the request's `per_page`.
    pub fn with_listing(self, category: CategoryId, ids: Vec<u64>) -> Self {
        self.state.lock().listings.insert(category, ids);
        self
    }

    pub fn script<I, R>(self, category: CategoryId, page: u32, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        self.state
            .lock()
            .scripted
            .entry((category, page))
            .or_default()
            .extend(replies.into_iter().map(Into::into));
        self
    }

    pub fn script_navigation<I, R>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<MockReply>,
    {
        self.state
            .lock()
            .navigation
            .extend(replies.into_iter().map(Into::into));
        self
    }

    /// Every request through a backend of `kind` fails to connect.
    pub fn failing_for(self, kind: BackendKind) -> Self {
        self.state.lock().failing_kinds.push(kind);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn api_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.kind == RequestKind::Api)
            .collect()
    }

    fn listing_page(listing: &[u64], page: u32, per_page: usize) -> MockResponse {
        let start = (page.saturating_sub(1) as usize).saturating_mul(per_page);
        let ids = listing
            .get(start..)
            .map(|rest| &rest[..rest.len().min(per_page)])
            .unwrap_or(&[]);
        MockResponse::items(ids)
    }

    fn next_reply(&self, request: &HttpRequest) -> MockReply {
        let mut state = self.state.lock();
        if state.failing_kinds.contains(&self.kind) {
            return MockReply::Fail(TransportKind::Connect);
        }
        match request.kind {
            RequestKind::Navigate => state
                .navigation
                .pop_front()
                .unwrap_or_else(|| MockResponse::html("<html><head></head><body></body></html>").into()),
            RequestKind::Api => {
                let category = category_of(request).unwrap_or_default();
                let page = request.page.unwrap_or(1);
                if let Some(reply) = state
                    .scripted
                    .get_mut(&(category, page))
                    .and_then(VecDeque::pop_front)
                {
                    return reply;
                }
                let per_page = request
                    .param("per_page")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(96);
                match state.listings.get(&category) {
                    Some(listing) => Self::listing_page(listing, page, per_page).into(),
                    None => MockResponse::items(&[]).into(),
                }
            }
        }
    }
}

fn category_of(request: &HttpRequest) -> Option<CategoryId> {
    request.param("catalog_ids").and_then(|c| c.parse().ok())
}

#[async_trait]
impl FetchBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_raw(
        &self,
        request: &HttpRequest,
        profile: &RequestProfile<'_>,
    ) -> HarvestResult<HttpResponse> {
        let headers = profile.headers(request);
        self.state.lock().requests.push(RecordedRequest {
            backend: self.kind,
            kind: request.kind,
            url: request.full_url(),
            page: request.page,
            category: category_of(request),
            proxy: profile.proxy.map(|p| p.address.clone()),
            user_agent: profile.identity.user_agent.clone(),
            headers,
            cookie: profile.cookies.header_value(&request.full_url()),
            at: Instant::now(),
        });

        let response = match self.next_reply(request) {
            MockReply::Respond(response) => response,
            MockReply::Fail(kind) => {
                return Err(HarvestError::transport(kind, "scripted transport failure"))
            }
        };
        if let Some(delay) = response.delay {
            sleep(delay).await;
        }

        Ok(HttpResponse {
            url: request.full_url(),
            status: response.status,
            headers: response.headers.into_iter().collect(),
            set_cookies: response.set_cookies,
            body: response.body,
            timestamp: Utc::now(),
            elapsed: Duration::ZERO,
        })
    }
}

#[async_trait]
impl BackendFactory for MockBackend {
    async fn create(&self, kind: BackendKind) -> HarvestResult<Box<dyn FetchBackend>> {
        Ok(Box::new(self.as_kind(kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityGenerator;
    use crate::session::CookieJar;

    fn page_request(category: u64, page: u32) -> HttpRequest {
        HttpRequest::api(
            Url::parse("http://mock.test/api/v2/catalog/items").unwrap(),
            vec![
                ("per_page".into(), "2".into()),
                ("catalog_ids".into(), category.to_string()),
            ],
        )
        .with_page(page)
    }

    #[tokio::test]
    async fn test_scripts_take_precedence_over_listing() {
        let backend = MockBackend::new()
            .with_listing(5, vec![1, 2, 3])
            .script(5, 1, [MockResponse::status(429)]);
        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };

        let first = backend.fetch(&page_request(5, 1), &profile).await.unwrap();
        assert_eq!(first.status, 429);
        let second = backend.fetch(&page_request(5, 1), &profile).await.unwrap();
        assert!(second.body.contains("\"id\":1"));
        let last = backend.fetch(&page_request(5, 2), &profile).await.unwrap();
        assert!(last.body.contains("\"id\":3") && !last.body.contains("\"id\":2"));
        let empty = backend.fetch(&page_request(5, 3), &profile).await.unwrap();
        assert_eq!(empty.body, r#"{"items":[]}"#);

        assert_eq!(backend.api_requests().len(), 4);
    }

    #[tokio::test]
    async fn test_failing_kind() {
        let shared = MockBackend::new().failing_for(BackendKind::TlsMimic);
        let tls = shared.as_kind(BackendKind::TlsMimic);
        let identity = IdentityGenerator::new().generate();
        let cookies = CookieJar::new();
        let profile = RequestProfile {
            identity: &identity,
            proxy: None,
            cookies: &cookies,
            api_headers: Vec::new(),
            overrides: &[],
        };
        let request = HttpRequest::navigate(Url::parse("http://mock.test/").unwrap());
        assert!(tls.fetch(&request, &profile).await.is_err());
        assert_eq!(shared.fetch(&request, &profile).await.unwrap().status, 200);
        assert_eq!(shared.requests().len(), 2);
    }
}
