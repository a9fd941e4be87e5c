use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::http::RequestKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BrowserProfile {
    ChromeWindows,
    ChromeMac,
    EdgeWindows,
    FirefoxWindows,
    SafariMac,
    ChromeAndroid,
}

impl BrowserProfile {
    pub const ALL: [BrowserProfile; 6] = [
        BrowserProfile::ChromeWindows,
        BrowserProfile::ChromeMac,
        BrowserProfile::EdgeWindows,
        BrowserProfile::FirefoxWindows,
        BrowserProfile::SafariMac,
        BrowserProfile::ChromeAndroid,
    ];

    pub fn is_mobile(&self) -> bool {
        matches!(self, BrowserProfile::ChromeAndroid)
    }

    /// Chromium-based browsers are the only ones sending `sec-ch-ua*` hints.
    pub fn is_chromium(&self) -> bool {
        matches!(
            self,
            BrowserProfile::ChromeWindows
                | BrowserProfile::ChromeMac
                | BrowserProfile::EdgeWindows
                | BrowserProfile::ChromeAndroid
        )
    }

    pub fn platform(&self) -> &'static str {
        match self {
            BrowserProfile::ChromeWindows
            | BrowserProfile::EdgeWindows
            | BrowserProfile::FirefoxWindows => "Windows",
            BrowserProfile::ChromeMac | BrowserProfile::SafariMac => "macOS",
            BrowserProfile::ChromeAndroid => "Android",
        }
    }

    fn version_range(&self) -> (u32, u32) {
        match self {
            BrowserProfile::FirefoxWindows => (128, 133),
            BrowserProfile::SafariMac => (16, 18),
            _ => (126, 131),
        }
    }

    fn user_agent(&self, version: u32) -> String {
        match self {
            BrowserProfile::ChromeWindows => format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
                version
            ),
            BrowserProfile::ChromeMac => format!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Safari/537.36",
                version
            ),
            BrowserProfile::EdgeWindows => format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{v}.0.0.0 Safari/537.36 Edg/{v}.0.0.0",
                v = version
            ),
            BrowserProfile::FirefoxWindows => format!(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:{v}.0) Gecko/20100101 Firefox/{v}.0",
                v = version
            ),
            BrowserProfile::SafariMac => format!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/{}.0 Safari/605.1.15",
                version
            ),
            BrowserProfile::ChromeAndroid => format!(
                "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{}.0.0.0 Mobile Safari/537.36",
                version
            ),
        }
    }

    fn client_hints(&self, version: u32) -> Vec<(String, String)> {
        if !self.is_chromium() {
            return Vec::new();
        }
        let brand = match self {
            BrowserProfile::EdgeWindows => "Microsoft Edge",
            _ => "Google Chrome",
        };
        vec![
            (
                "sec-ch-ua".to_string(),
                format!(
                    "\"{brand}\";v=\"{v}\", \"Chromium\";v=\"{v}\", \"Not_A Brand\";v=\"24\"",
                    brand = brand,
                    v = version
                ),
            ),
            (
                "sec-ch-ua-mobile".to_string(),
                if self.is_mobile() { "?1" } else { "?0" }.to_string(),
            ),
            (
                "sec-ch-ua-platform".to_string(),
                format!("\"{}\"", self.platform()),
            ),
        ]
    }
}

impl fmt::Display for BrowserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrowserProfile::ChromeWindows => "chrome/windows",
            BrowserProfile::ChromeMac => "chrome/macos",
            BrowserProfile::EdgeWindows => "edge/windows",
            BrowserProfile::FirefoxWindows => "firefox/windows",
            BrowserProfile::SafariMac => "safari/macos",
            BrowserProfile::ChromeAndroid => "chrome/android",
        };
        f.write_str(name)
    }
}

/// Fingerprint presented by one session. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub profile: BrowserProfile,
    pub browser_version: u32,
    pub user_agent: String,
    pub client_hints: Vec<(String, String)>,
    pub accept_language: String,
    /// Anonymous visitor id used until the site issues its own.
    pub cookie_seed: String,
}

impl Identity {
    /// Headers in the order the browser sends them.
    pub fn headers_for(&self, kind: RequestKind) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(12);
        let chromium = self.profile.is_chromium();

        if chromium {
            headers.extend(self.client_hints.iter().cloned());
        }
        if kind == RequestKind::Navigate {
            headers.push(("upgrade-insecure-requests".into(), "1".into()));
        }
        headers.push(("user-agent".into(), self.user_agent.clone()));

        let (accept, dest, mode) = match kind {
            RequestKind::Navigate => (
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
                "document",
                "navigate",
            ),
            RequestKind::Api => ("application/json, text/plain, */*", "empty", "cors"),
        };
        headers.push(("accept".into(), accept.into()));
        headers.push(("sec-fetch-site".into(), "same-origin".into()));
        headers.push(("sec-fetch-mode".into(), mode.into()));
        if kind == RequestKind::Navigate {
            headers.push(("sec-fetch-user".into(), "?1".into()));
        }
        headers.push(("sec-fetch-dest".into(), dest.into()));
        headers.push(("accept-encoding".into(), "gzip, deflate, br".into()));
        headers.push(("accept-language".into(), self.accept_language.clone()));
        headers
    }
}

#[derive(Debug, Clone)]
pub struct IdentityGenerator {
    profiles: Vec<BrowserProfile>,
    languages: Vec<String>,
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self {
            profiles: BrowserProfile::ALL.to_vec(),
            languages: vec![
                "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
                "fr-FR,fr;q=0.9,en;q=0.8".to_string(),
                "fr,fr-FR;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            ],
        }
    }
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_mobile(mut self) -> Self {
        self.profiles.retain(|p| !p.is_mobile());
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<BrowserProfile>) -> Self {
        if !profiles.is_empty() {
            self.profiles = profiles;
        }
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        if !languages.is_empty() {
            self.languages = languages;
        }
        self
    }

    pub fn generate(&self) -> Identity {
        let mut rng = rand::thread_rng();
        let profile = self
            .profiles
            .choose(&mut rng)
            .copied()
            .unwrap_or(BrowserProfile::ChromeWindows);
        self.generate_for(profile)
    }

    pub fn generate_for(&self, profile: BrowserProfile) -> Identity {
        let mut rng = rand::thread_rng();
        let (low, high) = profile.version_range();
        let version = rng.gen_range(low..=high);
        let accept_language = self
            .languages
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| "en-US,en;q=0.9".to_string());

        Identity {
            profile,
            browser_version: version,
            user_agent: profile.user_agent(version),
            client_hints: profile.client_hints(version),
            accept_language,
            cookie_seed: Uuid::new_v4().to_string(),
        }
    }

    /// Request-pattern headers layered on top of an identity after a block.
    pub fn noise_headers(&self) -> Vec<(String, String)> {
        let mut rng = rand::thread_rng();
        let mut headers = Vec::new();
        if rng.gen_bool(0.5) {
            headers.push(("cache-control".to_string(), "no-cache".to_string()));
            headers.push(("pragma".to_string(), "no-cache".to_string()));
        }
        if rng.gen_bool(0.3) {
            headers.push(("dnt".to_string(), "1".to_string()));
        }
        if rng.gen_bool(0.5) {
            headers.push(("priority".to_string(), "u=1, i".to_string()));
        }
        headers
    }
}
