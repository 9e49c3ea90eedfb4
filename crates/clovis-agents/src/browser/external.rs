// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
//! Rich automation backend: the external runtime.
//!
//! The interactive browser-automation runtime is an external executable the
//! core drives: it owns the persistent headed session and the on-page
//! interaction loop.  This shim invokes it per task and relays the final
//! summary line.  Bootstrap failures (missing runtime, import errors in its
//! output) surface verbatim so the agent can recognize them and fall back
//! to the direct driver.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::RichBrowserBackend;

const RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Subprocess-backed rich automation session.
pub struct ExternalAutomation {
    runtime: Option<PathBuf>,
    model: String,
}

impl ExternalAutomation {
    /// `runtime` is the automation executable; `None` means unconfigured,
    /// which reports as a bootstrap error so the direct driver takes over.
    pub fn new(runtime: Option<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            runtime,
            model: model.into(),
        }
    }
}

#[async_trait]
impl RichBrowserBackend for ExternalAutomation {
    async fn run(&self, task: &str, available_files: &[String]) -> anyhow::Result<String> {
        let runtime = self
            .runtime
            .as_ref()
            .context("rich automation runtime not configured")?;

        let mut cmd = Command::new(runtime);
        cmd.arg("--task")
            .arg(task)
            .arg("--model")
            .arg(&self.model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for file in available_files {
            cmd.arg("--available-file").arg(file);
        }

        debug!(runtime = %runtime.display(), "launching rich automation runtime");
        let output = tokio::time::timeout(RUN_TIMEOUT, cmd.output())
            .await
            .context("rich automation run timed out")?
            .context("launching rich automation runtime")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            anyhow::bail!(
                "rich automation exited with {}: {}",
                output.status.code().unwrap_or(-1),
                if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() }
            );
        }

        let summary = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("Browser task completed.")
            .to_string();
        info!("rich automation completed");
        Ok(summary)
    }

    async fn shutdown(&self) {
        // The runtime owns its persistent session and reaps it on exit;
        // there is nothing to signal from here.
        debug!("rich automation shutdown requested");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
