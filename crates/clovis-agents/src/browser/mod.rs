// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Web-browser agent.
//!
//! Two backends share the agent's lifetime: a "rich automation" session
//! (an external automation runtime that can interact with pages) and a
//! navigation-only "direct driver".  Only one is active at a time; the
//! direct driver is a deterministic fallback used when the rich runtime
//! fails to bootstrap.  Direct-driver behavior is decided here (navigate
//! to an extracted URL, reuse a relevant open tab, or search) so the
//! driver itself stays a narrow protocol shim.

pub(crate) mod cdp;
pub(crate) mod external;

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{Agent, StatusTx, StepOutcome};

/// Selectors for the first result on a DuckDuckGo results page.
const SEARCH_RESULT_SELECTORS: &[&str] = &["a[data-testid='result-title-a']", "a.result__a"];
/// Settle delay after the final navigation before reading url/title.
const POST_ACTION_SETTLE: Duration = Duration::from_secs(1);

/// One open tab as seen by the direct driver.
#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

/// The persistent automation session (external runtime).
#[async_trait]
pub trait RichBrowserBackend: Send + Sync {
    /// Run one task in the persistent session and return its summary.
    async fn run(&self, task: &str, available_files: &[String]) -> anyhow::Result<String>;
    /// Kill the session (backend switch or stop_all).
    async fn shutdown(&self);
}

/// Navigation-only driver protocol.
#[async_trait]
pub trait DirectBrowserDriver: Send + Sync {
    async fn open_new_tab(&self) -> anyhow::Result<()>;
    async fn goto(&self, url: &str) -> anyhow::Result<()>;
    async fn pages(&self) -> Vec<PageInfo>;
    /// Make the page at `index` (into [`pages`]) the active one.
    async fn select_page(&self, index: usize) -> anyhow::Result<()>;
    /// Click the first element matching any selector.  `Ok(false)` when
    /// nothing matched within the driver's own wait budget.
    async fn click_first(&self, selectors: &[&str]) -> anyhow::Result<bool>;
    async fn current_url(&self) -> String;
    async fn title(&self) -> String;
    fn is_headless(&self) -> bool;
    async fn shutdown(&self);
}

/// Produces a direct driver on demand (headed-then-headless launch policy
/// lives behind this seam).
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Arc<dyn DirectBrowserDriver>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveBackend {
    None,
    Rich,
    Direct,
}

struct BackendState {
    active: ActiveBackend,
    direct: Option<Arc<dyn DirectBrowserDriver>>,
}

/// Browser automation agent.
pub struct BrowserAgent {
    rich: Arc<dyn RichBrowserBackend>,
    launcher: Arc<dyn DriverLauncher>,
    state: Mutex<BackendState>,
    status: Option<StatusTx>,
}

impl BrowserAgent {
    pub fn new(rich: Arc<dyn RichBrowserBackend>, launcher: Arc<dyn DriverLauncher>) -> Self {
        Self {
            rich,
            launcher,
            state: Mutex::new(BackendState {
                active: ActiveBackend::None,
                direct: None,
            }),
            status: None,
        }
    }

    pub fn with_status(mut self, status: StatusTx) -> Self {
        self.status = Some(status);
        self
    }

    async fn emit_status(&self, text: &str) {
        if let Some(tx) = &self.status {
            let _ = tx.send(text.to_string()).await;
        }
    }

    /// Tear down whichever backend is active.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match state.active {
            ActiveBackend::Rich => self.rich.shutdown().await,
            ActiveBackend::Direct => {
                if let Some(driver) = state.direct.take() {
                    driver.shutdown().await;
                }
            }
            ActiveBackend::None => {}
        }
        state.active = ActiveBackend::None;
        state.direct = None;
    }

    async fn run_rich(&self, task: &str) -> anyhow::Result<String> {
        let files = extract_available_file_paths(task);
        if !files.is_empty() {
            info!(?files, "browser task file whitelist");
        }
        let summary = self.rich.run(task, &files).await?;
        self.state.lock().await.active = ActiveBackend::Rich;
        info!("reusing persistent browser session for future tasks");
        Ok(summary)
    }

    async fn ensure_direct_driver(&self) -> anyhow::Result<Arc<dyn DirectBrowserDriver>> {
        let mut state = self.state.lock().await;
        if let Some(driver) = &state.direct {
            return Ok(Arc::clone(driver));
        }
        // Switching backends kills the other one.
        if state.active == ActiveBackend::Rich {
            self.rich.shutdown().await;
        }
        let driver = self.launcher.launch().await?;
        state.direct = Some(Arc::clone(&driver));
        state.active = ActiveBackend::Direct;
        Ok(driver)
    }

    async fn run_direct(
        &self,
        task: &str,
        direct_url: Option<&str>,
        bootstrap_error: &str,
    ) -> anyhow::Result<String> {
        let driver = self.ensure_direct_driver().await?;
        let mut action_mode = "direct_navigation";
        let mut used_search = false;
        let mut need_search_fallback = false;

        if is_open_new_tab_task(task) {
            match driver.open_new_tab().await {
                Ok(()) => action_mode = "new_tab",
                Err(_) => action_mode = "new_tab_current_context_unavailable",
            }
        } else if let Some(url) = direct_url {
            driver.goto(url).await?;
            action_mode = "direct_navigation";
        } else if must_avoid_search(task) {
            match select_relevant_existing_page(&*driver, task).await {
                Some(index) => {
                    driver.select_page(index).await?;
                    action_mode = "current_tab_context";
                }
                None => need_search_fallback = true,
            }
        } else {
            need_search_fallback = true;
        }

        if need_search_fallback {
            used_search = true;
            let query = task_to_search_query(task);
            let search_url = format!("https://duckduckgo.com/?q={}", url_encode(&query));
            driver.goto(&search_url).await?;
            if !driver.click_first(SEARCH_RESULT_SELECTORS).await.unwrap_or(false) {
                warn!("no search result could be opened");
            }
            action_mode = "search_fallback";
        }

        tokio::time::sleep(POST_ACTION_SETTLE).await;
        let final_url = driver.current_url().await;
        let title = driver.title().await;
        if !bootstrap_error.is_empty() {
            info!(%bootstrap_error, "direct driver completed after rich bootstrap failure");
        }
        Ok(build_fallback_summary(
            &final_url,
            &title,
            used_search,
            driver.is_headless(),
            action_mode,
        ))
    }
}

#[async_trait]
impl Agent for BrowserAgent {
    fn source(&self) -> &'static str {
        "browser"
    }

    async fn execute(&self, task: &str) -> StepOutcome {
        // Extract the direct URL from the ORIGINAL task before steering is
        // applied, so steering preamble text cannot produce false matches.
        let original_direct_url = extract_direct_url(task);
        let active = self.state.lock().await.active;

        // Steering applies only when a rich session already exists: fresh
        // sessions need freedom to navigate on their own.
        let steered;
        let task_for_rich: &str = if active == ActiveBackend::Rich {
            steered = steer_task_for_existing_page(task);
            &steered
        } else {
            task
        };

        self.emit_status("Working in browser...").await;

        match active {
            ActiveBackend::Rich => match self.run_rich(task_for_rich).await {
                Ok(summary) => StepOutcome::ok(self.source(), summary),
                Err(e) => StepOutcome::failed(self.source(), e.to_string()),
            },
            ActiveBackend::Direct => {
                match self
                    .run_direct(task, original_direct_url.as_deref(), "")
                    .await
                {
                    Ok(summary) => StepOutcome::ok(self.source(), summary),
                    Err(e) => StepOutcome::failed(self.source(), e.to_string()),
                }
            }
            ActiveBackend::None => {
                // Rich automation first: it can actually interact with pages.
                // The direct driver is a last resort for navigation-only work.
                match self.run_rich(task).await {
                    Ok(summary) => StepOutcome::ok(self.source(), summary),
                    Err(rich_err) => {
                        if !is_bootstrap_error(&rich_err.to_string()) {
                            return StepOutcome::failed(self.source(), rich_err.to_string());
                        }
                        warn!("rich automation unavailable: {rich_err}");
                        match self
                            .run_direct(task, original_direct_url.as_deref(), &rich_err.to_string())
                            .await
                        {
                            Ok(summary) => StepOutcome::ok(self.source(), summary),
                            Err(fallback_err) => StepOutcome::failed(
                                self.source(),
                                format!(
                                    "Browser task failed in both rich automation and the direct \
                                     driver fallback. bootstrap_error={rich_err}; \
                                     fallback_error={fallback_err}"
                                ),
                            ),
                        }
                    }
                }
            }
        }
    }
}

// ─── Task text analysis ───────────────────────────────────────────────────────

/// A URL stated directly in the task: an `http(s)://` token, a bare domain
/// on a known TLD, or localhost/127.0.0.1 with optional port and path.
pub(crate) fn extract_direct_url(task: &str) -> Option<String> {
    let task = task.trim();
    if task.is_empty() {
        return None;
    }

    static HTTP: OnceLock<Regex> = OnceLock::new();
    let http = HTTP.get_or_init(|| Regex::new(r"https?://[^\s]+").unwrap());
    if let Some(m) = http.find(task) {
        return Some(m.as_str().trim_end_matches(['.', ',', ')', ';']).to_string());
    }

    static DOMAIN: OnceLock<Regex> = OnceLock::new();
    let domain = DOMAIN.get_or_init(|| {
        Regex::new(r"\b([a-zA-Z0-9-]+\.(?:com|org|edu|gov|net|io|ai|co))\b").unwrap()
    });
    if let Some(cap) = domain.captures(task) {
        return Some(format!("https://{}", &cap[1]));
    }

    static LOCALHOST: OnceLock<Regex> = OnceLock::new();
    let localhost = LOCALHOST.get_or_init(|| {
        Regex::new(r"(?i)\b(localhost|127\.0\.0\.1)(?:\s*:\s*|\s+)?(\d{2,5})?([/\w\-.?=&%+]*)")
            .unwrap()
    });
    if let Some(cap) = localhost.captures(task) {
        let host = cap[1].to_lowercase();
        let mut url = format!("http://{host}");
        if let Some(port) = cap.get(2) {
            url.push(':');
            url.push_str(port.as_str());
        }
        let path = cap
            .get(3)
            .map(|m| m.as_str().trim_end_matches(['.', ',', ')', ';']))
            .unwrap_or("");
        if !path.is_empty() {
            if !path.starts_with('/') {
                url.push('/');
            }
            url.push_str(path);
        }
        return Some(url);
    }

    None
}

/// Likely local file paths mentioned in the task, for upload whitelisting:
/// quoted chunks plus unquoted absolute/home paths, each added in expanded,
/// absolute, raw, and basename form.
pub(crate) fn extract_available_file_paths(task: &str) -> Vec<String> {
    if task.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<String> = Vec::new();
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| Regex::new(r#"['"]([^'"]+)['"]"#).unwrap());
    for cap in quoted.captures_iter(task) {
        let q = cap[1].trim();
        if !q.is_empty() {
            candidates.push(q.to_string());
        }
    }
    static BARE: OnceLock<Regex> = OnceLock::new();
    let bare = BARE.get_or_init(|| Regex::new(r"(?:^|\s)(~/[^\s,;]+|/[^\s,;]+)").unwrap());
    for cap in bare.captures_iter(task) {
        candidates.push(cap[1].trim().to_string());
    }

    let mut resolved: Vec<String> = Vec::new();
    let mut add = |value: &str| {
        let p = value.trim().trim_matches(|c: char| ".,;:()[]{}'\"`".contains(c));
        if !p.is_empty() && !resolved.iter().any(|r| r == p) {
            resolved.push(p.to_string());
        }
    };

    for candidate in candidates {
        if !candidate.contains('/') && !candidate.contains('\\') && !candidate.contains('~') {
            continue;
        }
        let expanded = shellexpand::full(&candidate)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| candidate.clone());
        let absolute = if std::path::Path::new(&expanded).is_absolute() {
            expanded.clone()
        } else {
            std::env::current_dir()
                .map(|d| d.join(&expanded).display().to_string())
                .unwrap_or_else(|_| expanded.clone())
        };
        add(&expanded);
        add(&absolute);
        add(&candidate);
        if let Some(base) = std::path::Path::new(&expanded).file_name() {
            add(&base.to_string_lossy());
        }
    }

    resolved
}

pub(crate) fn is_open_new_tab_task(task: &str) -> bool {
    let lowered = task.to_lowercase();
    [
        "open a new browser tab",
        "open new browser tab",
        "open a new tab",
        "open new tab",
        "new tab",
    ]
    .iter()
    .any(|m| lowered.contains(m))
}

fn is_current_tab_context_task(task: &str) -> bool {
    let lowered = task.to_lowercase();
    [
        "currently open",
        "current tab",
        "already open",
        "on the page",
        "on this page",
        "that is open",
    ]
    .iter()
    .any(|m| lowered.contains(m))
}

fn wants_localhost(task: &str) -> bool {
    let lowered = task.to_lowercase();
    lowered.contains("localhost") || lowered.contains("127.0.0.1")
}

/// Search must be avoided when the task refers to an already-open page or a
/// local server: typing the whole task into a search bar would drift away
/// from the target.
pub(crate) fn must_avoid_search(task: &str) -> bool {
    is_current_tab_context_task(task) || wants_localhost(task)
}

/// Prepend strict constraints when the target page is already open in the
/// existing session, so the automation model does not drift into search.
pub(crate) fn steer_task_for_existing_page(task: &str) -> String {
    let localhost = wants_localhost(task);
    if !is_current_tab_context_task(task) && !localhost {
        return task.to_string();
    }

    if localhost {
        return format!(
            "HARD CONSTRAINT (LOCAL-SITE MODE):\n\
             - You MUST use the currently open local-server page/tab in this browser session.\n\
             - Do NOT perform web search.\n\
             - Do NOT type the full task sentence into the browser address/search bar.\n\
             - Do NOT navigate to unrelated public websites.\n\
             - If a navigation is required, only use local-server URLs (e.g. http://127.0.0.1:PORT).\n\
             - Prioritize interacting with the existing on-page UI to complete the task.\n\n\
             Task:\n{task}"
        );
    }

    format!(
        "IMPORTANT EXECUTION CONSTRAINTS:\n\
         - The target page is already open in the current browser session.\n\
         - Stay on the currently open relevant tab/page.\n\
         - Do NOT perform web search and do NOT navigate to unrelated sites.\n\
         - Do NOT type the full task sentence into the browser address/search bar.\n\
         - Only navigate if the task explicitly gives a direct URL.\n\
         - Prioritize interacting with existing on-page UI to complete the task.\n\n\
         Task:\n{task}"
    )
}

/// Tokens from the task that plausibly name the target site or app.
fn site_keywords(task: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "open", "click", "page", "this", "that", "with", "into", "from", "localhost",
        "browser", "current", "already", "then", "please", "site", "website", "server",
        "running", "local", "find", "search", "navigate",
    ];
    task.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 4 && !STOPWORDS.contains(t))
        .map(String::from)
        .collect()
}

/// Index of an open page matching the task: localhost pages when the task
/// wants a local server, otherwise any page whose url/title carries a task
/// keyword.
async fn select_relevant_existing_page(
    driver: &dyn DirectBrowserDriver,
    task: &str,
) -> Option<usize> {
    let pages = driver.pages().await;
    if pages.is_empty() {
        return None;
    }

    if wants_localhost(task) {
        if let Some(index) = pages.iter().position(|p| {
            let url = p.url.to_lowercase();
            url.contains("localhost") || url.contains("127.0.0.1")
        }) {
            return Some(index);
        }
    }

    let keywords = site_keywords(task);
    pages.iter().position(|p| {
        let url = p.url.to_lowercase();
        let title = p.title.to_lowercase();
        keywords.iter().any(|k| url.contains(k) || title.contains(k))
    })
}

pub(crate) fn task_to_search_query(task: &str) -> String {
    let cleaned = task.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return "official website".into();
    }
    static NAV_VERB: OnceLock<Regex> = OnceLock::new();
    let nav = NAV_VERB.get_or_init(|| Regex::new(r"(?i)\b(go to|open|visit)\b").unwrap());
    if nav.is_match(&cleaned) {
        cleaned
    } else {
        format!("{cleaned} official website")
    }
}

fn url_encode(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for byte in query.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

pub(crate) fn build_fallback_summary(
    final_url: &str,
    page_title: &str,
    used_search: bool,
    used_headless: bool,
    action_mode: &str,
) -> String {
    let mut mode_text = match action_mode {
        "new_tab" => "new-tab action".to_string(),
        "current_tab_context" => "current-tab context fallback".to_string(),
        _ if used_search => "search fallback".to_string(),
        _ => "direct navigation fallback".to_string(),
    };
    if used_headless {
        mode_text.push_str(" (headless)");
    }
    let title = page_title.trim();
    if title.is_empty() {
        format!("Browser task completed via {mode_text}: {final_url}")
    } else {
        format!("Browser task completed via {mode_text}: {title} ({final_url})")
    }
}

/// Errors that mean the rich runtime failed to bootstrap (as opposed to a
/// task-level failure): module/import/type errors from the external runtime.
pub(crate) fn is_bootstrap_error(text: &str) -> bool {
    let lowered = text.to_lowercase();
    [
        "failed to import",
        "no module named",
        "cannot import name",
        "unsupported operand type",
        "executable not found",
        "not configured",
    ]
    .iter()
    .any(|m| lowered.contains(m))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    // ── URL extraction ────────────────────────────────────────────────────────

    #[test]
    fn http_url_is_extracted_and_trimmed() {
        assert_eq!(
            extract_direct_url("go to https://github.com/example/repo, please").as_deref(),
            Some("https://github.com/example/repo")
        );
    }

    #[test]
    fn bare_domain_gets_https_scheme() {
        assert_eq!(
            extract_direct_url("open spotify.com for me").as_deref(),
            Some("https://spotify.com")
        );
    }

    #[test]
    fn localhost_with_port_and_path() {
        assert_eq!(
            extract_direct_url("open localhost:3000/dashboard").as_deref(),
            Some("http://localhost:3000/dashboard")
        );
        assert_eq!(
            extract_direct_url("check 127.0.0.1:8080").as_deref(),
            Some("http://127.0.0.1:8080")
        );
    }

    #[test]
    fn plain_prose_has_no_url() {
        assert!(extract_direct_url("search for cute cats").is_none());
    }

    #[test]
    fn steering_text_does_not_leak_urls() {
        // The steering preamble mentions 127.0.0.1:PORT; extraction must run
        // on the original task, so the agent extracts before steering.
        let steered = steer_task_for_existing_page("click submit on the current tab");
        assert!(extract_direct_url("click submit on the current tab").is_none());
        assert!(steered.contains("Task:\nclick submit"));
    }

    // ── File-path whitelist ───────────────────────────────────────────────────

    #[test]
    fn quoted_and_bare_paths_are_whitelisted() {
        let paths =
            extract_available_file_paths("upload '/tmp/report.pdf' and ~/notes/todo.txt please");
        assert!(paths.iter().any(|p| p == "/tmp/report.pdf"));
        assert!(paths.iter().any(|p| p == "report.pdf"));
        assert!(paths.iter().any(|p| p.ends_with("notes/todo.txt")));
        assert!(paths.iter().any(|p| p == "todo.txt"));
    }

    #[test]
    fn non_path_tokens_are_skipped() {
        let paths = extract_available_file_paths("say 'hello world' to the form");
        assert!(paths.is_empty());
    }

    // ── Steering & search avoidance ───────────────────────────────────────────

    #[test]
    fn localhost_task_gets_local_site_steering() {
        let steered = steer_task_for_existing_page("add an item on localhost:3000");
        assert!(steered.starts_with("HARD CONSTRAINT (LOCAL-SITE MODE):"));
    }

    #[test]
    fn current_tab_task_gets_reuse_steering() {
        let steered = steer_task_for_existing_page("fill the form on this page");
        assert!(steered.starts_with("IMPORTANT EXECUTION CONSTRAINTS:"));
    }

    #[test]
    fn unrelated_task_is_not_steered() {
        let task = "book a flight to NYC";
        assert_eq!(steer_task_for_existing_page(task), task);
    }

    #[test]
    fn must_avoid_search_for_localhost_and_open_pages() {
        assert!(must_avoid_search("test the app on 127.0.0.1:5173"));
        assert!(must_avoid_search("use the currently open dashboard"));
        assert!(!must_avoid_search("find the rust book"));
    }

    // ── Search query ──────────────────────────────────────────────────────────

    #[test]
    fn nav_verbs_keep_query_verbatim() {
        assert_eq!(task_to_search_query("go to  the rust book"), "go to the rust book");
    }

    #[test]
    fn plain_query_gets_official_website_suffix() {
        assert_eq!(task_to_search_query("spotify"), "spotify official website");
    }

    #[test]
    fn empty_query_defaults() {
        assert_eq!(task_to_search_query("   "), "official website");
    }

    // ── Summary ───────────────────────────────────────────────────────────────

    #[test]
    fn summary_names_mode_and_title() {
        let s = build_fallback_summary("https://x.test", "X Page", true, true, "search_fallback");
        assert_eq!(
            s,
            "Browser task completed via search fallback (headless): X Page (https://x.test)"
        );
    }

    #[test]
    fn summary_without_title_uses_url_only() {
        let s = build_fallback_summary("http://localhost:3000", "", false, false, "current_tab_context");
        assert_eq!(
            s,
            "Browser task completed via current-tab context fallback: http://localhost:3000"
        );
    }

    // ── Agent arbitration ─────────────────────────────────────────────────────

    struct FakeRich {
        fail_with: Option<String>,
        calls: StdMutex<Vec<String>>,
        shutdowns: StdMutex<usize>,
    }

    impl FakeRich {
        fn ok() -> Self {
            Self { fail_with: None, calls: StdMutex::new(vec![]), shutdowns: StdMutex::new(0) }
        }
        fn failing(msg: &str) -> Self {
            Self {
                fail_with: Some(msg.into()),
                calls: StdMutex::new(vec![]),
                shutdowns: StdMutex::new(0),
            }
        }
    }

    #[async_trait]
    impl RichBrowserBackend for FakeRich {
        async fn run(&self, task: &str, _files: &[String]) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push(task.to_string());
            match &self.fail_with {
                Some(msg) => anyhow::bail!("{msg}"),
                None => Ok(format!("rich completed: {task}")),
            }
        }
        async fn shutdown(&self) {
            *self.shutdowns.lock().unwrap() += 1;
        }
    }

    struct FakeDriver {
        pages: Vec<PageInfo>,
        log: StdMutex<Vec<String>>,
    }

    impl FakeDriver {
        fn new(pages: Vec<PageInfo>) -> Self {
            Self { pages, log: StdMutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl DirectBrowserDriver for FakeDriver {
        async fn open_new_tab(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push("new_tab".into());
            Ok(())
        }
        async fn goto(&self, url: &str) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("goto {url}"));
            Ok(())
        }
        async fn pages(&self) -> Vec<PageInfo> {
            self.pages.clone()
        }
        async fn select_page(&self, index: usize) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("select {index}"));
            Ok(())
        }
        async fn click_first(&self, _selectors: &[&str]) -> anyhow::Result<bool> {
            self.log.lock().unwrap().push("click_first".into());
            Ok(true)
        }
        async fn current_url(&self) -> String {
            "https://final.test".into()
        }
        async fn title(&self) -> String {
            "Final".into()
        }
        fn is_headless(&self) -> bool {
            false
        }
        async fn shutdown(&self) {}
    }

    struct FakeLauncher {
        driver: Arc<FakeDriver>,
    }

    #[async_trait]
    impl DriverLauncher for FakeLauncher {
        async fn launch(&self) -> anyhow::Result<Arc<dyn DirectBrowserDriver>> {
            Ok(Arc::clone(&self.driver) as Arc<dyn DirectBrowserDriver>)
        }
    }

    fn agent_with(rich: FakeRich, driver: Arc<FakeDriver>) -> BrowserAgent {
        BrowserAgent::new(Arc::new(rich), Arc::new(FakeLauncher { driver }))
    }

    #[tokio::test]
    async fn rich_backend_is_tried_first_and_kept() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let agent = agent_with(FakeRich::ok(), Arc::clone(&driver));
        let outcome = agent.execute("book a table").await;
        assert!(outcome.success);
        assert!(outcome.message.starts_with("rich completed"));
        assert_eq!(agent.state.lock().await.active, ActiveBackend::Rich);
        assert!(driver.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_failure_falls_back_to_direct_driver() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let agent = agent_with(FakeRich::failing("no module named browser_use"), Arc::clone(&driver));
        let outcome = agent.execute("open https://example.com/docs").await;
        assert!(outcome.success, "{outcome:?}");
        assert!(outcome.message.contains("direct navigation fallback"));
        let log = driver.log.lock().unwrap();
        assert_eq!(log[0], "goto https://example.com/docs");
    }

    #[tokio::test]
    async fn non_bootstrap_rich_failure_does_not_fall_back() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let agent = agent_with(FakeRich::failing("element not found on page"), Arc::clone(&driver));
        let outcome = agent.execute("click the missing button").await;
        assert!(!outcome.success);
        assert!(driver.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn localhost_task_reuses_matching_open_tab() {
        let driver = Arc::new(FakeDriver::new(vec![
            PageInfo { url: "https://news.test".into(), title: "News".into() },
            PageInfo { url: "http://127.0.0.1:3000".into(), title: "Dev Dashboard".into() },
        ]));
        let agent = agent_with(FakeRich::failing("no module named browser_use"), Arc::clone(&driver));
        // Avoid-search path: the task names the local server, but carries no
        // parseable URL token once "localhost" is absent.
        let outcome = agent
            .execute("press save on the dev dashboard that is open on the local server tab")
            .await;
        assert!(outcome.success);
        assert!(outcome.message.contains("current-tab context fallback"), "{outcome:?}");
        let log = driver.log.lock().unwrap();
        assert!(log.iter().any(|l| l == "select 1"), "{log:?}");
    }

    #[tokio::test]
    async fn plain_task_uses_search_fallback() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let agent = agent_with(FakeRich::failing("failed to import agent"), Arc::clone(&driver));
        let outcome = agent.execute("find the rust book for me").await;
        assert!(outcome.success);
        assert!(outcome.message.contains("search fallback"));
        let log = driver.log.lock().unwrap();
        assert!(log[0].starts_with("goto https://duckduckgo.com/?q="));
        assert_eq!(log[1], "click_first");
    }

    #[tokio::test]
    async fn direct_backend_is_sticky_once_chosen() {
        let driver = Arc::new(FakeDriver::new(vec![]));
        let rich = FakeRich::failing("no module named browser_use");
        let agent = agent_with(rich, Arc::clone(&driver));
        let _ = agent.execute("open https://a.test").await;
        let _ = agent.execute("open https://b.test").await;
        // Rich is only attempted on the first call.
        assert_eq!(agent.state.lock().await.active, ActiveBackend::Direct);
        let log = driver.log.lock().unwrap();
        assert!(log.iter().any(|l| l == "goto https://b.test"));
    }
}
