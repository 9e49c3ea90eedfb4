// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8765
}

fn default_rapid_model() -> String {
    "gemini-3-flash-preview".into()
}

fn default_clovis_model() -> String {
    "gemini-2.0-flash".into()
}

/// The settings.json file shared between the orchestrator and the overlay
/// renderer.  The bootstrap routine rewrites `host`/`port` (free-port
/// selection) and `screen_width`/`screen_height` (startup capture or
/// renderer-reported viewport) back to disk, so unknown keys written by the
/// renderer must survive a round-trip, hence `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub screen_width: u32,
    #[serde(default)]
    pub screen_height: u32,
    #[serde(default)]
    pub viewport_width: u32,
    #[serde(default)]
    pub viewport_height: u32,
    /// Router model used for the per-turn delegation loop.
    #[serde(default = "default_rapid_model")]
    pub rapid_response_model: String,
    /// Model used by the annotation and vision agents.
    #[serde(default = "default_clovis_model")]
    pub clovis_model: String,
    #[serde(default)]
    pub tts: TtsSettings,
    #[serde(default)]
    pub personalization: Option<String>,
    /// Keys we do not model (renderer-private settings) round-trip here.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            screen_width: 0,
            screen_height: 0,
            viewport_width: 0,
            viewport_height: 0,
            rapid_response_model: default_rapid_model(),
            clovis_model: default_clovis_model(),
            tts: TtsSettings::default(),
            personalization: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl Settings {
    /// Screen size with a 1920×1080 fallback when nothing has been recorded.
    pub fn screen_size(&self) -> (u32, u32) {
        if self.screen_width > 0 && self.screen_height > 0 {
            (self.screen_width, self.screen_height)
        } else {
            (1920, 1080)
        }
    }

    /// Viewport size, falling back to the screen size.
    pub fn viewport_size(&self) -> (u32, u32) {
        if self.viewport_width > 0 && self.viewport_height > 0 {
            (self.viewport_width, self.viewport_height)
        } else {
            self.screen_size()
        }
    }
}

/// Optional text-to-speech endpoint.  The core only fires a "speak this
/// text" side effect; a missing URL or API key disables it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key (never the key itself).
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl TtsSettings {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
