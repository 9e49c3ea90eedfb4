// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Execution agents.
//!
//! Every backend (screen annotation, browser automation, shell CLI,
//! GUI vision) exposes the single [`Agent`] capability.  The router only
//! depends on this trait: agents never propagate errors across that
//! boundary, every failure becomes a [`StepOutcome`] with `success: false`.

mod browser;
mod cli;
mod clovis;
mod procs;
mod tts;
mod vision;

pub use browser::{
    BrowserAgent, DirectBrowserDriver, DriverLauncher, PageInfo, RichBrowserBackend,
};
pub use browser::cdp::CdpLauncher;
pub use browser::external::ExternalAutomation;
pub use cli::{CliAgent, CliResponse, ToolCallRecord};
pub use clovis::ClovisAgent;
pub use procs::{ManagedProcess, ProcessManager};
pub use tts::TtsClient;
pub use vision::{
    CaptureContext, ClickKind, EnigoInput, InputDriver, ScreenCapture, VisionAgent, VisionError,
};

use async_trait::async_trait;

/// Live status line stream.  Agents push short human-readable strings
/// ("Running command: npm start…"); the router forwards them to the status
/// bubble.  A dropped receiver silently disables status reporting.
pub type StatusTx = tokio::sync::mpsc::Sender<String>;

/// The outcome of one delegated agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    /// Result text on success, error text on failure.  Always non-empty.
    pub message: String,
    /// Theming/logging tag of the producing agent.
    pub source: String,
}

impl StepOutcome {
    pub fn ok(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn failed(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            source: source.into(),
        }
    }
}

/// An execution backend.  `execute` must be infallible at the type level:
/// errors are reported inside the returned outcome.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable tag used in chain steps and status payloads.
    fn source(&self) -> &'static str;

    async fn execute(&self, task: &str) -> StepOutcome;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
