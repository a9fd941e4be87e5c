use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

use super::browser::{BrowserContext, BrowserDriver, PageResponse};
use crate::identity::Identity;
use crate::proxy::ProxyRef;
use crate::{HarvestError, HarvestResult};

const NAVIGATION_STATUS_JS: &str = "(() => { const e = performance.getEntriesByType('navigation')[0]; return e && e.responseStatus ? e.responseStatus : 0; })()";

/// Zero means the page exposed no navigation status; warm-up must not
/// mistake that for success.
fn navigation_status(raw: u16, url: &Url) -> HarvestResult<u16> {
    if raw == 0 {
        return Err(HarvestError::Browser(format!(
            "no navigation status for {}",
            url
        )));
    }
    Ok(raw)
}

#[derive(Debug, Clone)]
pub struct ChromiumConfig {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub request_timeout: Duration,
}

impl Default for ChromiumConfig {
    fn default() -> Self {
        Self {
            executable: std::env::var("CHROMIUM_PATH").ok().map(PathBuf::from),
            headless: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn browser_err(e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Browser(e.to_string())
}

/// Chromium over the DevTools protocol. One browser process, one incognito
/// context per session.
pub struct ChromiumDriver {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
}

impl ChromiumDriver {
    pub async fn launch(config: ChromiumConfig) -> HarvestResult<Self> {
        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(config.request_timeout)
            .window_size(1920, 1080)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-infobars")
            .arg("--mute-audio");
        if let Some(path) = config.executable {
            builder = builder.chrome_executable(path);
        }
        builder = if config.headless {
            builder.headless_mode(HeadlessMode::default())
        } else {
            builder.with_head()
        };
        let browser_config = builder.build().map_err(browser_err)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(browser_err)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let message = e.to_string();
                    if message.contains("did not match any variant") {
                        debug!("Ignoring unknown CDP message: {}", message);
                    } else {
                        error!("Browser handler error: {}", message);
                    }
                }
            }
            debug!("Browser handler finished");
        });
        info!("Chromium launched");

        Ok(Self {
            browser: Arc::new(Mutex::new(browser)),
            handler,
        })
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn new_context(
        &self,
        identity: &Identity,
        proxy: Option<&ProxyRef>,
    ) -> HarvestResult<Box<dyn BrowserContext>> {
        let mut params = CreateBrowserContextParams::default();
        if let Some(proxy) = proxy {
            let mut url = Url::parse(&proxy.address)?;
            if !url.username().is_empty() {
                warn!("Chromium cannot authenticate to proxies; credentials dropped");
                let _ = url.set_username("");
                let _ = url.set_password(None);
            }
            params.proxy_server = Some(url.to_string().trim_end_matches('/').to_string());
        }

        let mut browser = self.browser.lock().await;
        let context_id = browser
            .create_browser_context(params)
            .await
            .map_err(browser_err)?;
        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(browser_err)?;
        let page = browser.new_page(target).await.map_err(browser_err)?;
        drop(browser);

        let user_agent = SetUserAgentOverrideParams::builder()
            .user_agent(identity.user_agent.clone())
            .accept_language(identity.accept_language.clone())
            .build()
            .map_err(browser_err)?;
        page.set_user_agent(user_agent).await.map_err(browser_err)?;

        Ok(Box::new(ChromiumContext {
            browser: Arc::clone(&self.browser),
            context_id,
            page,
        }))
    }

    async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            warn!("Closing Chromium failed: {}", e);
        }
        let _ = browser.wait().await;
        self.handler.abort();
    }
}

struct ChromiumContext {
    browser: Arc<Mutex<Browser>>,
    context_id: BrowserContextId,
    page: Page,
}

#[derive(Deserialize)]
struct InPageResponse {
    status: u16,
    body: String,
    headers: HashMap<String, String>,
}

impl ChromiumContext {
    async fn eval<T: serde::de::DeserializeOwned>(&self, expression: String) -> HarvestResult<T> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(browser_err)?;
        self.page
            .evaluate(params)
            .await
            .map_err(browser_err)?
            .into_value::<T>()
            .map_err(browser_err)
    }
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn navigate(&self, url: &Url) -> HarvestResult<PageResponse> {
        self.page.goto(url.as_str()).await.map_err(browser_err)?;
        let raw: u16 = self.eval(NAVIGATION_STATUS_JS.to_string()).await?;
        let status = navigation_status(raw, url)?;
        let body = self.page.content().await.map_err(browser_err)?;
        Ok(PageResponse {
            status,
            body,
            headers: HashMap::new(),
        })
    }

    async fn fetch_in_page(
        &self,
        url: &Url,
        headers: &[(String, String)],
        referrer: Option<&Url>,
    ) -> HarvestResult<PageResponse> {
        let headers: HashMap<&str, &str> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let script = format!(
            r#"(async () => {{
                const r = await fetch({url}, {{ credentials: 'include', headers: {headers}, referrer: {referrer} }});
                const headers = {{}};
                r.headers.forEach((v, k) => {{ headers[k] = v; }});
                return {{ status: r.status, body: await r.text(), headers }};
            }})()"#,
            url = serde_json::to_string(url.as_str())?,
            headers = serde_json::to_string(&headers)?,
            referrer = serde_json::to_string(&referrer.map(|r| r.as_str()).unwrap_or("about:client"))?,
        );
        let response: InPageResponse = self.eval(script).await?;
        Ok(PageResponse {
            status: response.status,
            body: response.body,
            headers: response.headers,
        })
    }

    async fn cookies(&self) -> HarvestResult<Vec<(String, String)>> {
        let cookies = self.page.get_cookies().await.map_err(browser_err)?;
        Ok(cookies.into_iter().map(|c| (c.name, c.value)).collect())
    }

    async fn is_alive(&self) -> bool {
        self.eval::<u8>("1".to_string()).await.is_ok()
    }

    async fn close(&self) {
        let page = self.page.clone();
        if let Err(e) = page.close().await {
            debug!("Closing page failed: {}", e);
        }
        let browser = self.browser.lock().await;
        if let Err(e) = browser.dispose_browser_context(self.context_id.clone()).await {
            debug!("Disposing browser context failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_navigation_status_is_an_error() {
        let url = Url::parse("https://www.site.test/").unwrap();
        assert!(navigation_status(0, &url).is_err());
        assert_eq!(navigation_status(403, &url).unwrap(), 403);
        assert_eq!(navigation_status(200, &url).unwrap(), 200);
    }
}
