//! Headless Chromium driven over the DevTools protocol.
//!
//! Each engine is a child process with its own throwaway profile directory.
//! The directory name doubles as the process marker the orphan sweep looks
//! for, so stray renderers from a crashed engine can be found later.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use super::cdp::CdpConnection;
use super::{BrowserEngine, BrowserLauncher, ExecutionContext};
use crate::config::Config;

const DEVTOOLS_BANNER: &str = "DevTools listening on ";

#[derive(Debug, Clone)]
pub struct ChromiumSettings {
    pub binary: String,
    pub navigation_timeout: Duration,
    pub command_timeout: Duration,
    pub startup_timeout: Duration,
    pub extra_args: Vec<String>,
    /// Parent directory for per-engine profiles.
    pub profile_root: PathBuf,
}

impl ChromiumSettings {
    pub fn from_config(config: &Config) -> Self {
        ChromiumSettings {
            binary: config.browser_binary.clone(),
            navigation_timeout: Duration::from_secs(config.navigation_timeout_secs),
            command_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(20),
            extra_args: Vec::new(),
            profile_root: std::env::temp_dir(),
        }
    }
}

pub struct ChromiumLauncher {
    settings: ChromiumSettings,
    http: reqwest::Client,
    marker: String,
    launched: AtomicU64,
}

impl ChromiumLauncher {
    pub fn new(settings: ChromiumSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        ChromiumLauncher {
            settings,
            http,
            marker: format!("livescrape-profile-{}", std::process::id()),
            launched: AtomicU64::new(0),
        }
    }

    fn args(&self, profile_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--headless=new".to_string(),
            "--remote-debugging-port=0".to_string(),
            format!("--user-data-dir={}", profile_dir.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-background-networking".to_string(),
            "--disable-extensions".to_string(),
            "--mute-audio".to_string(),
        ];
        args.extend(self.settings.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }

    /// Ask the HTTP endpoint for the browser version, confirming the
    /// debugger is actually serving.
    async fn fetch_version(&self, ws_url: &str) -> Result<String> {
        let parsed = url::Url::parse(ws_url).context("bad DevTools URL")?;
        let host = parsed.host_str().context("DevTools URL has no host")?;
        let port = parsed.port().context("DevTools URL has no port")?;
        let endpoint = format!("http://{}:{}/json/version", host, port);

        let version: Value = self
            .http
            .get(&endpoint)
            .send()
            .await
            .with_context(|| format!("GET {} failed", endpoint))?
            .error_for_status()?
            .json()
            .await?;
        Ok(version["Browser"].as_str().unwrap_or("unknown").to_string())
    }

    /// Wait for the DevTools banner, confirm the endpoint and open the socket.
    async fn handshake(&self, child: &mut Child) -> Result<(String, CdpConnection)> {
        let stderr = child.stderr.take().context("browser stderr not captured")?;
        let ws_url = tokio::time::timeout(self.settings.startup_timeout, read_devtools_url(stderr))
            .await
            .map_err(|_| {
                anyhow!(
                    "browser did not expose DevTools within {:?}",
                    self.settings.startup_timeout
                )
            })??;
        let version = self.fetch_version(&ws_url).await?;
        let conn = CdpConnection::connect(&ws_url).await?;
        Ok((version, conn))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserEngine>> {
        let n = self.launched.fetch_add(1, Ordering::Relaxed);
        let profile_dir = self
            .settings
            .profile_root
            .join(format!("{}-{}", self.marker, n));

        let mut child = Command::new(&self.settings.binary)
            .args(self.args(&profile_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.settings.binary))?;
        let pid = child.id();

        let (version, conn) = match self.handshake(&mut child).await {
            Ok(ready) => ready,
            Err(e) => {
                // kill() also reaps the child.
                if let Err(kill_err) = child.kill().await {
                    debug!("[Chromium] kill pid {:?}: {}", pid, kill_err);
                }
                remove_profile(&profile_dir).await;
                return Err(e);
            }
        };
        info!("[Chromium] Launched {} (pid {:?})", version, pid);

        Ok(Arc::new(ChromiumEngine {
            pid,
            child: Mutex::new(Some(child)),
            conn: Arc::new(conn),
            profile_dir,
            settings: self.settings.clone(),
        }))
    }

    fn process_marker(&self) -> Option<String> {
        Some(self.marker.clone())
    }
}

/// Read stderr until the DevTools banner appears. The rest of the stream is
/// drained in the background so the browser never blocks on a full pipe.
async fn read_devtools_url(stderr: ChildStderr) -> Result<String> {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(url) = parse_devtools_banner(&line) {
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[Chromium] {}", line);
                }
            });
            return Ok(url);
        }
    }
    bail!("browser exited before exposing DevTools")
}

fn parse_devtools_banner(line: &str) -> Option<String> {
    let url = line.trim().strip_prefix(DEVTOOLS_BANNER)?.trim();
    url.starts_with("ws://").then(|| url.to_string())
}

async fn remove_profile(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("[Chromium] Could not remove profile {}: {}", dir.display(), e),
    }
}

pub struct ChromiumEngine {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    conn: Arc<CdpConnection>,
    profile_dir: PathBuf,
    settings: ChromiumSettings,
}

impl ChromiumEngine {
    async fn browser_call(&self, method: &str, params: Value) -> Result<Value> {
        self.conn
            .call(method, params, None, self.settings.command_timeout)
            .await
    }

    /// Create a page inside `browser_context_id`, attach to it and enable
    /// page events.
    async fn open_page(&self, browser_context_id: &str) -> Result<ChromiumContext> {
        let target = self
            .browser_call(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": browser_context_id }),
            )
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .context("createTarget returned no id")?
            .to_string();

        let attached = self
            .browser_call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .context("attachToTarget returned no session")?
            .to_string();

        let ctx = ChromiumContext {
            target_id,
            browser_context_id: browser_context_id.to_string(),
            session_id,
            conn: Arc::clone(&self.conn),
            settings: self.settings.clone(),
        };
        ctx.page_call("Page.enable", json!({})).await?;
        Ok(ctx)
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let running = match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        };
        running && self.conn.is_alive()
    }

    async fn new_context(&self) -> Result<Box<dyn ExecutionContext>> {
        let created = self
            .browser_call("Target.createBrowserContext", json!({ "disposeOnDetach": true }))
            .await?;
        let browser_context_id = created["browserContextId"]
            .as_str()
            .context("createBrowserContext returned no id")?
            .to_string();

        match self.open_page(&browser_context_id).await {
            Ok(ctx) => Ok(Box::new(ctx)),
            Err(e) => {
                if let Err(dispose_err) = self
                    .browser_call(
                        "Target.disposeBrowserContext",
                        json!({ "browserContextId": browser_context_id }),
                    )
                    .await
                {
                    debug!(
                        "[Chromium] disposeBrowserContext {}: {}",
                        browser_context_id, dispose_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.conn.is_alive() {
            if let Err(e) = self
                .conn
                .call("Browser.close", json!({}), None, Duration::from_secs(3))
                .await
            {
                debug!("[Chromium] Browser.close: {}", e);
            }
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("[Chromium] pid {:?} ignored Browser.close, killing", self.pid);
                    child.kill().await.context("kill browser")?;
                }
            }
        }

        remove_profile(&self.profile_dir).await;
        Ok(())
    }
}

pub struct ChromiumContext {
    target_id: String,
    browser_context_id: String,
    session_id: String,
    conn: Arc<CdpConnection>,
    settings: ChromiumSettings,
}

impl ChromiumContext {
    async fn page_call(&self, method: &str, params: Value) -> Result<Value> {
        self.conn
            .call(
                method,
                params,
                Some(&self.session_id),
                self.settings.command_timeout,
            )
            .await
    }
}

#[async_trait]
impl ExecutionContext for ChromiumContext {
    fn id(&self) -> &str {
        &self.target_id
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settings.navigation_timeout;

        let result = self.page_call("Page.navigate", json!({ "url": url })).await?;
        if let Some(err) = result["errorText"].as_str().filter(|e| !e.is_empty()) {
            bail!("navigation to {} failed: {}", url, err);
        }

        loop {
            let state = self.evaluate("document.readyState").await?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "navigation to {} timed out after {:?}",
                    url,
                    self.settings.navigation_timeout
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .page_call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("script threw");
            bail!("script exception: {}", text);
        }
        Ok(result["result"]["value"].clone())
    }

    async fn memory_usage(&self) -> Result<u64> {
        let heap = self.page_call("Runtime.getHeapUsage", json!({})).await?;
        let used = heap["usedSize"]
            .as_f64()
            .context("getHeapUsage returned no usedSize")?;
        Ok(used.max(0.0) as u64)
    }

    async fn reset(&self) -> Result<()> {
        self.page_call("Page.navigate", json!({ "url": "about:blank" }))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let timeout = self.settings.command_timeout;
        self.conn
            .call(
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
                None,
                timeout,
            )
            .await?;
        self.conn
            .call(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.browser_context_id }),
                None,
                timeout,
            )
            .await?;
        Ok(())
    }
}
