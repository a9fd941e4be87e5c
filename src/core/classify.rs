use chrono::Utc;
use log::{debug, warn};
use std::time::Duration;

use crate::core::config::SiteConfig;
use crate::core::retry::{parse_retry_after, RetryPolicy, RetryReason};
use crate::http::{parse_items, HttpResponse, Item};
use crate::HarvestResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    Empty,
    RateLimited,
    Blocked,
    Unauthorized,
    TransientError,
    Malformed,
}

impl StatusClass {
    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            StatusClass::RateLimited => Some(RetryReason::RateLimit),
            StatusClass::Blocked => Some(RetryReason::Blocked),
            StatusClass::Unauthorized => Some(RetryReason::Unauthorized),
            StatusClass::TransientError => Some(RetryReason::Transient),
            _ => None,
        }
    }
}

/// One classified attempt at a catalog page.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status_class: StatusClass,
    pub items: Vec<Item>,
    /// `None` when the request never produced a response.
    pub raw_status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub detail: String,
}

impl FetchResult {
    fn new(status_class: StatusClass, raw_status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            status_class,
            items: Vec::new(),
            raw_status,
            retry_after: None,
            detail: detail.into(),
        }
    }
}

/// Maps raw transport outcomes onto [`StatusClass`].
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    items_field: String,
    retry: RetryPolicy,
}

impl ResponseClassifier {
    pub fn new(site: &SiteConfig, retry: &RetryPolicy) -> Self {
        Self {
            items_field: site.items_field.clone(),
            retry: retry.clone(),
        }
    }

    pub fn classify(&self, outcome: &HarvestResult<HttpResponse>) -> FetchResult {
        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                debug!("Transport failure: {}", e);
                return FetchResult::new(StatusClass::TransientError, None, e.to_string());
            }
        };

        let status = Some(response.status);
        match response.status {
            200..=299 => self.classify_body(response),
            429 => {
                let retry_after = response
                    .header("retry-after")
                    .and_then(|value| parse_retry_after(value, Utc::now()));
                FetchResult {
                    retry_after,
                    ..FetchResult::new(StatusClass::RateLimited, status, "429 Too Many Requests")
                }
            }
            403 => FetchResult::new(StatusClass::Blocked, status, "403 Forbidden"),
            401 => FetchResult::new(StatusClass::Unauthorized, status, "401 Unauthorized"),
            other => FetchResult::new(
                StatusClass::TransientError,
                status,
                format!("unexpected status {}", other),
            ),
        }
    }

    fn classify_body(&self, response: &HttpResponse) -> FetchResult {
        let status = Some(response.status);
        match parse_items(&response.body, &self.items_field) {
            Ok(items) if items.is_empty() => {
                FetchResult::new(StatusClass::Empty, status, "no items")
            }
            Ok(items) => FetchResult {
                detail: format!("{} items", items.len()),
                items,
                ..FetchResult::new(StatusClass::Ok, status, "")
            },
            Err(_) if self.retry.is_block_page(&response.body) => {
                warn!("Challenge page served with status {}", response.status);
                FetchResult::new(StatusClass::Blocked, status, "challenge page")
            }
            Err(e) => FetchResult::new(StatusClass::Malformed, status, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{HarvestError, TransportKind};
    use std::collections::HashMap;
    use url::Url;

    fn response(status: u16, body: &str) -> HarvestResult<HttpResponse> {
        Ok(HttpResponse {
            url: Url::parse("http://localhost/api").unwrap(),
            status,
            headers: HashMap::new(),
            set_cookies: Vec::new(),
            body: body.to_string(),
            timestamp: Utc::now(),
            elapsed: Duration::ZERO,
        })
    }

    fn classifier() -> ResponseClassifier {
        ResponseClassifier::new(&SiteConfig::default(), &RetryPolicy::default())
    }

    #[test]
    fn test_success_bodies() {
        let c = classifier();
        let ok = c.classify(&response(200, r#"{"items":[{"id":1},{"id":2}]}"#));
        assert_eq!(ok.status_class, StatusClass::Ok);
        assert_eq!(ok.items.len(), 2);

        let empty = c.classify(&response(200, r#"{"items":[]}"#));
        assert_eq!(empty.status_class, StatusClass::Empty);
    }

    #[test]
    fn test_challenge_page_is_blocked_but_garbage_is_malformed() {
        let c = classifier();
        let challenge = c.classify(&response(200, "<html><title>Just a moment...</title></html>"));
        assert_eq!(challenge.status_class, StatusClass::Blocked);

        let garbage = c.classify(&response(200, "<html>hello</html>"));
        assert_eq!(garbage.status_class, StatusClass::Malformed);
    }

    #[test]
    fn test_error_statuses() {
        let c = classifier();
        assert_eq!(c.classify(&response(403, "")).status_class, StatusClass::Blocked);
        assert_eq!(c.classify(&response(401, "")).status_class, StatusClass::Unauthorized);
        assert_eq!(c.classify(&response(503, "")).status_class, StatusClass::TransientError);

        let timeout: HarvestResult<HttpResponse> =
            Err(HarvestError::transport(TransportKind::Timeout, "deadline"));
        let result = c.classify(&timeout);
        assert_eq!(result.status_class, StatusClass::TransientError);
        assert_eq!(result.raw_status, None);
    }

    #[test]
    fn test_rate_limit_reads_retry_after() {
        let mut limited = response(429, "").unwrap();
        limited
            .headers
            .insert("retry-after".to_string(), "2".to_string());
        let result = classifier().classify(&Ok(limited));
        assert_eq!(result.status_class, StatusClass::RateLimited);
        assert_eq!(result.retry_after, Some(Duration::from_secs(2)));
        assert_eq!(result.status_class.retry_reason(), Some(RetryReason::RateLimit));
    }
}
