use super::*;
use crate::proxy::{ProxyConfig, ProxyPool, ProxyProber, StaticProxySource};
use crate::scrapers::{MockBackend, MockReply, MockResponse};
use crate::core::errors::TransportKind;
use crate::http::RequestKind;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct AlwaysAlive;

#[async_trait]
impl ProxyProber for AlwaysAlive {
    async fn probe(&self, _address: &str) -> bool {
        true
    }
}

fn config(base: &str) -> Arc<HarvestConfig> {
    Arc::new(
        HarvestConfig::default()
            .without_delays()
            .with_site(SiteConfig::default().with_base_url(base)),
    )
}

fn direct_proxies() -> ProxyHandle {
    Arc::new(ProxyPool::direct()).handle(0)
}

fn supervisor(mock: &MockBackend, proxies: ProxyHandle) -> SessionSupervisor {
    SessionSupervisor::new(
        config("http://mock.test/"),
        IdentityGenerator::new(),
        Arc::new(mock.clone()),
        proxies,
        StatsTracker::new(),
    )
}

const LANDING: &str = r#"<html><head><meta name="csrf-token" content="tok-123"></head><body></body></html>"#;

#[tokio::test]
async fn test_create_session_warms_up_and_scrapes_tokens() {
    let mock = MockBackend::new().script_navigation([
        MockResponse::html(LANDING).with_cookie("anon_id=site-anon; Path=/")
    ]);
    let supervisor = supervisor(&mock, direct_proxies());

    let session = supervisor.create_session().await.unwrap();
    assert_eq!(session.backend_kind(), BackendKind::TlsMimic);
    assert_eq!(session.tokens.get("csrf").map(String::as_str), Some("tok-123"));
    assert_eq!(session.anon_id(), "site-anon");

    let paths: Vec<String> = mock.requests().iter().map(|r| r.url.path().to_string()).collect();
    assert_eq!(paths, vec!["/", "/catalog"]);

    let profile = session.profile();
    assert!(profile
        .api_headers
        .contains(&("x-csrf-token".to_string(), "tok-123".to_string())));
    assert!(profile
        .api_headers
        .contains(&("x-anon-id".to_string(), "site-anon".to_string())));
}

#[tokio::test]
async fn test_anon_id_falls_back_to_seed() {
    let mock = MockBackend::new();
    let session = supervisor(&mock, direct_proxies()).create_session().await.unwrap();
    assert_eq!(session.anon_id(), session.identity.cookie_seed);
}

#[tokio::test]
async fn test_strategies_fall_back_in_order() {
    let mock = MockBackend::new()
        .failing_for(BackendKind::TlsMimic)
        .failing_for(BackendKind::Browser);
    let session = supervisor(&mock, direct_proxies()).create_session().await.unwrap();
    assert_eq!(session.backend_kind(), BackendKind::Plain);

    let backends: Vec<BackendKind> = mock.requests().iter().map(|r| r.backend).collect();
    assert_eq!(
        &backends[..3],
        &[BackendKind::TlsMimic, BackendKind::Browser, BackendKind::Plain]
    );
}

#[tokio::test]
async fn test_catalog_failure_is_not_fatal() {
    let mock = MockBackend::new().script_navigation([
        MockReply::from(MockResponse::html(LANDING)),
        MockReply::Fail(TransportKind::Timeout),
    ]);
    assert!(supervisor(&mock, direct_proxies()).create_session().await.is_some());
}

#[tokio::test]
async fn test_creation_is_bounded_and_invalidates_blocked_proxies() {
    let mock = MockBackend::new().script_navigation(vec![MockResponse::status(403); 5]);
    let pool = Arc::new(ProxyPool::new(
        ProxyConfig::default(),
        vec![Box::new(StaticProxySource::new([
            "http://p1:80",
            "http://p2:80",
            "http://p3:80",
        ]))],
        Arc::new(AlwaysAlive),
    ));
    let supervisor = supervisor(&mock, pool.handle(0));

    assert!(supervisor.create_session().await.is_none());

    let requests = mock.requests();
    assert_eq!(requests.len(), 5);
    let proxies: Vec<Option<String>> = requests.iter().map(|r| r.proxy.clone()).collect();
    assert_eq!(proxies[0].as_deref(), Some("http://p1:80"));
    assert_eq!(proxies[1].as_deref(), Some("http://p2:80"));
    assert_eq!(proxies[2].as_deref(), Some("http://p3:80"));
    assert_eq!(proxies[3], None);
}

#[tokio::test]
async fn test_rebuild_discards_identity_and_cookies() {
    let mock = MockBackend::new();
    let supervisor = supervisor(&mock, direct_proxies());
    let session = supervisor.create_session().await.unwrap();
    let home = session.site().home_url().unwrap();
    session.cookies.insert(&home, "old", "1");
    assert_eq!(session.cookies.get("old").as_deref(), Some("1"));
    let old_seed = session.identity.cookie_seed.clone();
    let old_id = session.id;

    let rebuilt = supervisor.rebuild(session).await.unwrap();
    assert_ne!(rebuilt.id, old_id);
    assert_ne!(rebuilt.identity.cookie_seed, old_seed);
    assert!(rebuilt.cookies.get("old").is_none());
}

#[tokio::test]
async fn test_rotate_identity_clears_cookies() {
    let mock = MockBackend::new();
    let supervisor = supervisor(&mock, direct_proxies());
    let mut session = supervisor.create_session().await.unwrap();
    let home = session.site().home_url().unwrap();
    session.cookies.insert(&home, "anon_id", "x");
    assert_eq!(session.anon_id(), "x");
    let old_seed = session.identity.cookie_seed.clone();

    supervisor.rotate_identity(&mut session).await;
    assert!(session.cookies.is_empty());
    assert_ne!(session.identity.cookie_seed, old_seed);
}

#[tokio::test]
async fn test_refresh_cookies_visits_home_and_catalog() {
    let mock = MockBackend::new();
    let supervisor = supervisor(&mock, direct_proxies());
    let session = supervisor.create_session().await.unwrap();
    supervisor.refresh_cookies(&session).await.unwrap();

    let navigations = mock
        .requests()
        .iter()
        .filter(|r| r.kind == RequestKind::Navigate)
        .count();
    assert_eq!(navigations, 4);
}

#[tokio::test]
async fn test_real_transport_session_against_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "anon_id=srv-anon; Path=/")
                .set_body_string(LANDING),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&format!("{}/", server.uri()));
    let factory = ReqwestBackendFactory::new(&config);
    assert!(!factory.supports(BackendKind::Browser));
    let supervisor = SessionSupervisor::new(
        config,
        IdentityGenerator::new(),
        Arc::new(factory),
        direct_proxies(),
        StatsTracker::new(),
    );

    let session = supervisor.create_session().await.unwrap();
    assert_eq!(session.backend_kind(), BackendKind::TlsMimic);
    assert_eq!(session.anon_id(), "srv-anon");
    assert_eq!(session.tokens.get("csrf").map(String::as_str), Some("tok-123"));
}

#[test]
fn test_extract_tokens_without_meta() {
    assert!(extract_tokens("<html><head></head></html>").is_empty());
}
