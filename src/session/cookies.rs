use cookie_store::CookieStore;
use log::debug;
use parking_lot::Mutex;
use url::Url;

/// Per-session cookie store. Set-Cookie semantics (expiry, domain and
/// path scoping) come from `cookie_store`.
#[derive(Debug, Default)]
pub struct CookieJar {
    store: Mutex<CookieStore>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies raw `Set-Cookie` header values received from `url`.
    pub fn absorb<S: AsRef<str>>(&self, url: &Url, set_cookies: &[S]) {
        let mut store = self.store.lock();
        for raw in set_cookies {
            if let Err(e) = store.parse(raw.as_ref(), url) {
                debug!("Ignoring cookie from {}: {}", url, e);
            }
        }
    }

    /// Stores a bare name/value pair scoped to the whole host of `url`.
    pub fn insert(&self, url: &Url, name: &str, value: &str) {
        let raw = format!("{}={}; Path=/", name, value);
        if let Err(e) = self.store.lock().parse(&raw, url) {
            debug!("Ignoring cookie {} for {}: {}", name, url, e);
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.store
            .lock()
            .iter_unexpired()
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
    }

    pub fn clear(&self) {
        self.store.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.store.lock().iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.store
            .lock()
            .iter_unexpired()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect()
    }

    /// Value for a `Cookie` request header to `url`, `None` when nothing matches.
    pub fn header_value(&self, url: &Url) -> Option<String> {
        let store = self.store.lock();
        let mut pairs: Vec<String> = store
            .get_request_values(url)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Url {
        Url::parse("https://www.site.test/").unwrap()
    }

    #[test]
    fn test_absorb_and_header() {
        let jar = CookieJar::new();
        jar.absorb(
            &site(),
            &[
                "anon_id=abc-123; Path=/; HttpOnly",
                "_vinted_fr_session=xyz; Path=/; Secure; SameSite=Lax",
            ],
        );
        assert_eq!(jar.get("anon_id").as_deref(), Some("abc-123"));
        assert_eq!(
            jar.header_value(&site().join("/api/v2/catalog/items").unwrap())
                .as_deref(),
            Some("_vinted_fr_session=xyz; anon_id=abc-123")
        );
    }

    #[test]
    fn test_max_age_zero_removes_cookie() {
        let jar = CookieJar::new();
        jar.insert(&site(), "token", "1");
        jar.absorb(&site(), &["token=; Max-Age=0; Path=/"]);
        assert!(jar.get("token").is_none());
        assert!(jar.header_value(&site()).is_none());
    }

    #[test]
    fn test_expires_in_the_past_removes_cookie() {
        let jar = CookieJar::new();
        jar.absorb(&site(), &["anon_id=abc; Path=/"]);
        jar.absorb(
            &site(),
            &["anon_id=deleted; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT"],
        );
        assert!(jar.get("anon_id").is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn test_domain_and_path_scoping() {
        let jar = CookieJar::new();
        jar.absorb(
            &site(),
            &[
                "foreign=1; Domain=other.test; Path=/",
                "scoped=1; Path=/member",
            ],
        );
        assert!(jar.get("foreign").is_none());
        assert!(jar.header_value(&site()).is_none());
        assert_eq!(
            jar.header_value(&site().join("/member/42").unwrap()).as_deref(),
            Some("scoped=1")
        );
    }

    #[test]
    fn test_clear_and_garbage() {
        let jar = CookieJar::new();
        jar.absorb(&site(), &["garbage", "=novalue", "ok=1"]);
        assert_eq!(jar.get("ok").as_deref(), Some("1"));
        jar.clear();
        assert!(jar.is_empty());
    }
}
