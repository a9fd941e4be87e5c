pub mod browser;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod http_scraper;
pub mod mock_scraper;
pub mod tls_mimic;

mod scraper;
pub use browser::{BrowserBackend, BrowserContext, BrowserDriver, PageResponse};
#[cfg(feature = "browser")]
pub use chromium::{ChromiumConfig, ChromiumDriver};
pub use http_scraper::PlainBackend;
pub use mock_scraper::{MockBackend, MockReply, MockResponse, RecordedRequest};
pub use scraper::{BackendKind, FetchBackend, RequestProfile};
pub use tls_mimic::TlsMimicBackend;
