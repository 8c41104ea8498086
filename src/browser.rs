//! Chromium-backed pool resources.
//!
//! Each pooled resource is one browser process (or one connection to a
//! remote browser). Pages are opened per fetch and closed afterwards, so a
//! browser can be handed from job to job without leaking tabs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::handler::HandlerConfig;
use chromiumoxide::{Browser, BrowserConfig, Handler, Page};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Settings, Timeouts};
use crate::error::{Error, Result};
use crate::pool::{PooledResource, ResourceFactory};

/// User agent presented by launched browsers.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    // Linux
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    // macOS
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    // Common install locations
    "/opt/google/chrome/google-chrome",
];

const CHROME_COMMANDS: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// Navigation failures that will not go away by trying again.
const PERMANENT_NAV_ERRORS: &[&str] = &[
    "net::ERR_NAME_NOT_RESOLVED",
    "net::ERR_INVALID_URL",
    "net::ERR_UNKNOWN_URL_SCHEME",
    "net::ERR_BLOCKED_BY_CLIENT",
];

/// Resolves once the document has parsed, or after 10s regardless.
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// How browsers are launched or connected to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChromiumOptions {
    pub headless: bool,
    pub chrome_args: Vec<String>,
    /// Connect to this DevTools endpoint instead of launching Chrome.
    pub remote_url: Option<String>,
    pub timeouts: Timeouts,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_args: Vec::new(),
            remote_url: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl ChromiumOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            headless: settings.pool.headless,
            chrome_args: settings.pool.chrome_args.clone(),
            remote_url: settings.pool.remote_url.clone(),
            timeouts: settings.timeouts,
        }
    }

    /// Chrome flags passed on launch, custom args last.
    pub fn launch_args(&self) -> Vec<String> {
        [
            "--disable-blink-features=AutomationControlled",
            "--disable-infobars",
            "--disable-dev-shm-usage",
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-background-networking",
            "--disable-sync",
            "--disable-translate",
            "--metrics-recording-only",
            "--safebrowsing-disable-auto-update",
            // Often needed for headless in containers
            "--no-sandbox",
            "--disable-gpu",
            "--disable-software-rasterizer",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .chain(self.chrome_args.iter().cloned())
        .collect()
    }
}

/// Rendered page content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub html: String,
}

/// Launches (or connects to) one browser per pool slot.
#[derive(Debug, Clone, Default)]
pub struct ChromiumFactory {
    options: ChromiumOptions,
}

impl ChromiumFactory {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ChromiumOptions {
        &self.options
    }

    async fn launch(&self) -> anyhow::Result<BrowserInstance> {
        info!("Launching browser (headless={})", self.options.headless);

        let chrome_path = find_chrome()?;
        let profile_dir =
            std::env::temp_dir().join(format!("bumi-chrome-{}", uuid::Uuid::new_v4().simple()));

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&profile_dir)
            .request_timeout(self.options.timeouts.page_load());

        // with_head means NOT headless
        if !self.options.headless {
            builder = builder.with_head();
        }
        for arg in self.options.launch_args() {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        Ok(BrowserInstance::new(
            browser,
            handler,
            self.options.timeouts,
            Some(profile_dir),
        ))
    }

    async fn connect_remote(&self, url: &str) -> anyhow::Result<BrowserInstance> {
        info!("Connecting to remote browser at {}", url);

        // The WebSocket URL comes from the /json/version endpoint
        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let resp: serde_json::Value = reqwest::Client::new()
            .get(&version_url)
            .timeout(self.options.timeouts.navigation())
            .send()
            .await
            .context("Failed to connect to remote browser")?
            .json()
            .await
            .context("Failed to parse browser version info")?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("No webSocketDebuggerUrl in response"))?;

        debug!("Connecting to WebSocket: {}", ws_url);

        let handler_config = HandlerConfig {
            request_timeout: self.options.timeouts.page_load(),
            ..Default::default()
        };
        let (browser, handler) = Browser::connect_with_config(ws_url, handler_config)
            .await
            .context("Failed to connect to remote browser")?;

        Ok(BrowserInstance::new(
            browser,
            handler,
            self.options.timeouts,
            None,
        ))
    }
}

#[async_trait]
impl ResourceFactory for ChromiumFactory {
    type Resource = BrowserInstance;

    async fn create(&self) -> anyhow::Result<BrowserInstance> {
        match &self.options.remote_url {
            Some(url) => self.connect_remote(url).await,
            None => self.launch().await,
        }
    }
}

/// One browser owned by the pool.
pub struct BrowserInstance {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    timeouts: Timeouts,
    /// Throwaway profile of a launched browser; `None` for remote browsers,
    /// which are left running on close.
    profile_dir: Option<PathBuf>,
}

impl BrowserInstance {
    fn new(
        browser: Browser,
        mut handler: Handler,
        timeouts: Timeouts,
        profile_dir: Option<PathBuf>,
    ) -> Self {
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Self {
            browser: Mutex::new(browser),
            handler,
            timeouts,
            profile_dir,
        }
    }

    /// Render `url` in a fresh tab and return its HTML. With `wait_for`,
    /// also waits (up to the element timeout) for that CSS selector.
    ///
    /// Timeouts and browser-level failures are [`Error::Transient`];
    /// malformed or unresolvable URLs are [`Error::Operation`].
    pub async fn fetch_html(&self, url: &str, wait_for: Option<&str>) -> Result<FetchedPage> {
        let parsed = Url::parse(url).map_err(|e| Error::Operation {
            target: url.to_string(),
            message: format!("invalid URL: {}", e),
        })?;

        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| transient(url, format!("failed to open tab: {}", e)))?
        };

        // Close the tab whatever happened inside.
        let result = self.fetch_in(&page, parsed.as_str(), wait_for).await;
        if let Err(e) = page.close().await {
            debug!("Failed to close tab for {}: {}", url, e);
        }
        result
    }

    async fn fetch_in(&self, page: &Page, url: &str, wait_for: Option<&str>) -> Result<FetchedPage> {
        page.execute(SetUserAgentOverrideParams::new(BROWSER_USER_AGENT.to_string()))
            .await
            .map_err(|e| transient(url, format!("failed to set user agent: {}", e)))?;

        self.navigate(page, url).await?;
        self.wait_for_ready(page).await;

        if let Some(selector) = wait_for {
            debug!("Waiting for selector: {}", selector);
            match tokio::time::timeout(self.timeouts.element_wait(), page.find_element(selector))
                .await
            {
                Ok(Ok(_)) => debug!("Selector found"),
                Ok(Err(e)) => warn!("Selector {} not found on {}: {}", selector, url, e),
                Err(_) => {
                    return Err(transient(
                        url,
                        format!("timed out waiting for selector {}", selector),
                    ))
                }
            }
        }

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());
        let html = page
            .content()
            .await
            .map_err(|e| transient(url, format!("failed to read page content: {}", e)))?;

        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            html,
        })
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<()> {
        info!("Navigating to {}", url);
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| Error::Operation {
                target: url.to_string(),
                message: format!("invalid URL: {}", e),
            })?;

        let limit = self.timeouts.navigation();
        let response = tokio::time::timeout(limit, page.execute(params))
            .await
            .map_err(|_| transient(url, format!("navigation timed out after {:?}", limit)))?
            .map_err(|e| transient(url, format!("navigation failed: {}", e)))?;

        if let Some(error_text) = response.result.error_text.as_deref() {
            return Err(classify_nav_error(url, error_text));
        }
        Ok(())
    }

    async fn wait_for_ready(&self, page: &Page) {
        match tokio::time::timeout(
            self.timeouts.script(),
            page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()),
        )
        .await
        {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }
    }
}

#[async_trait]
impl PooledResource for BrowserInstance {
    async fn close(&self) -> anyhow::Result<()> {
        let closed = match self.profile_dir {
            Some(_) => {
                let mut browser = self.browser.lock().await;
                let result = browser.close().await.map(|_| ());
                // Reap the child so it does not linger as a zombie.
                let _ = browser.wait().await;
                result.context("Failed to close browser")
            }
            None => Ok(()),
        };

        self.handler.abort();

        if let Some(dir) = &self.profile_dir {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Failed to remove browser profile {}: {}", dir.display(), e);
                }
            }
        }

        closed
    }
}

fn transient(url: &str, message: String) -> Error {
    Error::Transient {
        target: url.to_string(),
        message,
    }
}

fn classify_nav_error(url: &str, error_text: &str) -> Error {
    if PERMANENT_NAV_ERRORS.iter().any(|e| error_text.contains(e)) {
        Error::Operation {
            target: url.to_string(),
            message: format!("navigation failed: {}", error_text),
        }
    } else {
        transient(url, format!("navigation failed: {}", error_text))
    }
}

/// Find a Chrome executable in the usual install locations or on `PATH`.
pub fn find_chrome() -> anyhow::Result<PathBuf> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    find_chrome_in(
        CHROME_PATHS.iter().map(Path::new),
        std::env::var_os("PATH"),
        &cwd,
    )
    .ok_or_else(|| {
        anyhow::anyhow!(
            "Chrome/Chromium not found. Please install it:\n\
             - Arch/Manjaro: sudo pacman -S chromium\n\
             - Ubuntu/Debian: sudo apt install chromium-browser\n\
             - Fedora: sudo dnf install chromium\n\
             - Or download from: https://www.google.com/chrome/\n\
             Alternatively set pool.remote_url (or BUMI_BROWSER_URL) to use a running browser."
        )
    })
}

fn find_chrome_in<'a>(
    known: impl IntoIterator<Item = &'a Path>,
    path_var: Option<OsString>,
    cwd: &Path,
) -> Option<PathBuf> {
    if let Some(found) = known.into_iter().find_map(|p| which::which(p).ok()) {
        info!("Found Chrome at: {}", found.display());
        return Some(found);
    }

    CHROME_COMMANDS
        .iter()
        .find_map(|cmd| which::which_in(cmd, path_var.as_ref(), cwd).ok())
        .inspect(|found| info!("Found Chrome in PATH: {}", found.display()))
}
