// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
//! CDP-backed direct driver.
//!
//! Navigation-only backend speaking the Chrome DevTools Protocol through
//! `chromiumoxide`.  Launch policy: bundled/default chromium headed, then
//! headless, then well-known local browser executables, accumulating
//! launch errors and reporting the last six when everything fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DirectBrowserDriver, DriverLauncher, PageInfo};

const CLICK_ATTEMPTS: u32 = 10;
const CLICK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Launches the CDP driver with the headed-then-headless policy.
#[derive(Default)]
pub struct CdpLauncher;

impl CdpLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DriverLauncher for CdpLauncher {
    async fn launch(&self) -> anyhow::Result<Arc<dyn DirectBrowserDriver>> {
        let mut errors: Vec<String> = Vec::new();

        for headless in [false, true] {
            match try_launch(None, headless).await {
                Ok(driver) => return Ok(driver),
                Err(e) => errors.push(format!("default chromium headless={headless}: {e}")),
            }
        }

        for executable in known_browser_executables() {
            for headless in [false, true] {
                match try_launch(Some(&executable), headless).await {
                    Ok(driver) => return Ok(driver),
                    Err(e) => errors.push(format!(
                        "executable {} headless={headless}: {e}",
                        executable.display()
                    )),
                }
            }
        }

        let start = errors.len().saturating_sub(6);
        anyhow::bail!(
            "Could not launch browser driver. Tried the default chromium and local executables. \
             Launch errors: {}",
            errors[start..].join(" | ")
        );
    }
}

fn known_browser_executables() -> Vec<PathBuf> {
    [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/microsoft-edge",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .filter(|p| p.exists())
    .collect()
}

async fn try_launch(
    executable: Option<&Path>,
    headless: bool,
) -> anyhow::Result<Arc<dyn DirectBrowserDriver>> {
    let mut builder = BrowserConfig::builder()
        .args(vec!["--disable-crashpad", "--disable-crash-reporter"]);
    if !headless {
        builder = builder.with_head();
    }
    if let Some(exe) = executable {
        builder = builder.chrome_executable(exe);
    }
    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .context("launching browser over CDP")?;
    let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

    let page = browser
        .new_page("about:blank")
        .await
        .context("opening initial page")?;

    debug!(headless, "CDP driver launched");
    Ok(Arc::new(CdpDriver {
        browser: Mutex::new(browser),
        active_page: Mutex::new(page),
        enumerated: Mutex::new(Vec::new()),
        headless,
        handler_task,
    }))
}

struct CdpDriver {
    browser: Mutex<Browser>,
    active_page: Mutex<Page>,
    /// Pages from the last `pages()` enumeration; `select_page` indices
    /// refer to this snapshot.
    enumerated: Mutex<Vec<Page>>,
    headless: bool,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl DirectBrowserDriver for CdpDriver {
    async fn open_new_tab(&self) -> anyhow::Result<()> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .context("opening new tab")?;
        *self.active_page.lock().await = page;
        Ok(())
    }

    async fn goto(&self, url: &str) -> anyhow::Result<()> {
        let page = self.active_page.lock().await.clone();
        page.goto(url).await.with_context(|| format!("navigating to {url}"))?;
        Ok(())
    }

    async fn pages(&self) -> Vec<PageInfo> {
        let pages = match self.browser.lock().await.pages().await {
            Ok(pages) => pages,
            Err(e) => {
                warn!("page enumeration failed: {e}");
                return Vec::new();
            }
        };
        let mut infos = Vec::with_capacity(pages.len());
        for page in &pages {
            let url = page.url().await.ok().flatten().unwrap_or_default();
            let title = page.get_title().await.ok().flatten().unwrap_or_default();
            infos.push(PageInfo { url, title });
        }
        *self.enumerated.lock().await = pages;
        infos
    }

    async fn select_page(&self, index: usize) -> anyhow::Result<()> {
        let page = {
            let enumerated = self.enumerated.lock().await;
            enumerated
                .get(index)
                .cloned()
                .with_context(|| format!("no enumerated page at index {index}"))?
        };
        page.bring_to_front().await.context("activating page")?;
        *self.active_page.lock().await = page;
        Ok(())
    }

    async fn click_first(&self, selectors: &[&str]) -> anyhow::Result<bool> {
        let page = self.active_page.lock().await.clone();
        for selector in selectors {
            for _ in 0..CLICK_ATTEMPTS {
                match page.find_element(*selector).await {
                    Ok(element) => {
                        element.click().await.context("clicking element")?;
                        let _ = page.wait_for_navigation().await;
                        return Ok(true);
                    }
                    Err(_) => tokio::time::sleep(CLICK_RETRY_DELAY).await,
                }
            }
        }
        Ok(false)
    }

    async fn current_url(&self) -> String {
        let page = self.active_page.lock().await.clone();
        page.url().await.ok().flatten().unwrap_or_default()
    }

    async fn title(&self) -> String {
        let page = self.active_page.lock().await.clone();
        page.get_title().await.ok().flatten().unwrap_or_default()
    }

    fn is_headless(&self) -> bool {
        self.headless
    }

    async fn shutdown(&self) {
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("browser close failed: {e}");
        }
        self.handler_task.abort();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_executables_only_lists_existing_files() {
        for path in known_browser_executables() {
            assert!(path.exists());
        }
    }
}
