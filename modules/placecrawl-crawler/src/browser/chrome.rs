// Chrome DevTools backend via chromiumoxide.
//
// One browser process (local launch or a remote Browserless session) is shared
// by the whole run. Every `open()` creates a fresh browser context so phases do
// not share cookies or storage; closing the tab disposes that context.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use placecrawl_common::file_config::ResourceKind;

use super::{BrowsingContext, ContextFactory};

/// Interval between selector probes in `wait_for`.
const WAIT_POLL: Duration = Duration::from_millis(250);
/// Per-command CDP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the browser process lives.
#[derive(Debug, Clone)]
pub enum BrowserBackend {
    /// Launch Chrome locally. `None` lets chromiumoxide search the usual paths.
    Local {
        chrome_bin: Option<String>,
        headless: bool,
    },
    /// Attach to a DevTools websocket, e.g. a Browserless endpoint.
    Remote { ws_url: String },
}

pub struct ChromeBrowser {
    browser: Arc<RwLock<Browser>>,
    handler: JoinHandle<()>,
}

impl ChromeBrowser {
    pub async fn launch(backend: &BrowserBackend) -> Result<Self> {
        let (browser, mut handler) = match backend {
            BrowserBackend::Local {
                chrome_bin,
                headless,
            } => {
                let mut builder = BrowserConfig::builder()
                    .no_sandbox()
                    .request_timeout(REQUEST_TIMEOUT)
                    .arg("--disable-dev-shm-usage")
                    .arg("--disable-gpu");
                if let Some(bin) = chrome_bin {
                    builder = builder.chrome_executable(bin);
                }
                if !headless {
                    builder = builder.with_head();
                }
                let config = builder.build().map_err(|e| anyhow!("Invalid browser config: {e}"))?;
                info!(headless, "Launching local Chrome");
                Browser::launch(config)
                    .await
                    .context("Failed to launch Chrome")?
            }
            BrowserBackend::Remote { ws_url } => {
                info!("Connecting to remote browser");
                Browser::connect(ws_url.as_str())
                    .await
                    .context("Failed to connect to remote browser")?
            }
        };

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event error");
                }
            }
            debug!("CDP handler finished");
        });

        Ok(Self {
            browser: Arc::new(RwLock::new(browser)),
            handler,
        })
    }

    /// Close the browser and stop the event handler.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut browser = self.browser.write().await;
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser close failed");
            }
        }
        self.handler.abort();
        Ok(())
    }
}

#[async_trait]
impl ContextFactory for ChromeBrowser {
    async fn open(&self) -> Result<Box<dyn BrowsingContext>> {
        let browser = self.browser.read().await;
        let context_id = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .context("Failed to create browser context")?
            .result
            .browser_context_id;

        let mut params = CreateTargetParams::new("about:blank");
        params.browser_context_id = Some(context_id.clone());
        let page = match browser.new_page(params).await {
            Ok(page) => page,
            Err(e) => {
                // Don't leave an empty context behind.
                let _ = browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await;
                return Err(anyhow!("Failed to open tab: {e}"));
            }
        };

        Ok(Box::new(ChromeContext {
            page,
            context_id,
            browser: self.browser.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// ChromeContext
// ---------------------------------------------------------------------------

struct ChromeContext {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<RwLock<Browser>>,
}

impl ChromeContext {
    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T> {
        let value = self
            .page
            .evaluate(script)
            .await
            .context("Script evaluation failed")?
            .into_value::<T>()?;
        Ok(value)
    }
}

/// Selector as a JS string literal.
fn js_str(selector: &str) -> Result<String> {
    Ok(serde_json::to_string(selector)?)
}

#[async_trait]
impl BrowsingContext for ChromeContext {
    async fn block_resources(&self, kinds: &[ResourceKind]) -> Result<()> {
        let urls: Vec<String> = kinds
            .iter()
            .flat_map(|kind| kind.url_patterns().iter().map(|p| p.to_string()))
            .collect();
        if urls.is_empty() {
            return Ok(());
        }
        self.page.execute(EnableParams::default()).await?;
        self.page.execute(SetBlockedUrLsParams::new(urls)).await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Navigation to {url} failed"))?;
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let script = format!("document.querySelector({}) !== null", js_str(selector)?);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.eval::<bool>(script.clone()).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn count(&self, selector: &str) -> Result<usize> {
        let script = format!("document.querySelectorAll({}).length", js_str(selector)?);
        self.eval(script).await
    }

    async fn scroll_to_end(&self, container: Option<&str>) -> Result<u64> {
        let target = match container {
            Some(selector) => format!("document.querySelector({})", js_str(selector)?),
            None => "(document.scrollingElement || document.documentElement)".to_string(),
        };
        let script = format!(
            "(() => {{ const el = {target}; if (!el) return 0; \
             el.scrollTop = el.scrollHeight; \
             window.scrollTo(0, document.body ? document.body.scrollHeight : 0); \
             return Math.round(el.scrollHeight); }})()"
        );
        self.eval(script).await
    }

    async fn click(&self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); \
             if (!el) return false; el.click(); return true; }})()",
            js_str(selector)?
        );
        self.eval(script).await
    }

    async fn html(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.page.clone().close().await {
            debug!(error = %e, "Tab close failed");
        }
        let browser = self.browser.read().await;
        browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
            .context("Failed to dispose browser context")?;
        Ok(())
    }
}
