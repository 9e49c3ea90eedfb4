// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
//! Text-to-speech side effect.
//!
//! The core only fires "speak this text" at an HTTP endpoint and stores the
//! returned audio under the temp dir; playback is the host's concern.
//! Missing configuration downgrades every call to a log line.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use clovis_config::TtsSettings;

pub struct TtsClient {
    url: Option<String>,
    api_key: Option<String>,
    active: bool,
    audio_path: PathBuf,
    client: reqwest::Client,
}

impl TtsClient {
    pub fn from_settings(settings: &TtsSettings) -> Self {
        Self {
            url: settings.url.clone(),
            api_key: settings.api_key(),
            active: settings.active,
            audio_path: std::env::temp_dir().join("clovis_audio.mp3"),
            client: reqwest::Client::new(),
        }
    }

    /// Collapse escaped control sequences models sometimes emit in text
    /// destined for speech.
    fn preprocess(text: &str) -> String {
        text.replace("\\'", "'")
            .replace("\\\\", "\\")
            .replace("\\n", "\n")
            .replace("\\r", "\r")
            .replace("\\t", "\t")
    }

    /// Fire the speech request.  Every failure is tolerated: status text
    /// must never be blocked on audio.
    pub async fn speak(&self, text: &str) {
        if !self.active {
            return;
        }
        let text = Self::preprocess(text);
        info!(%text, "speaking");

        let (Some(url), Some(api_key)) = (&self.url, &self.api_key) else {
            debug!("tts endpoint not configured, skipping audio");
            return;
        };

        let body = serde_json::json!({
            "text": text,
            "model_id": "eleven_monolingual_v1",
            "voice_settings": { "stability": 0.5, "similarity_boost": 0.5 }
        });

        let response = self
            .client
            .post(url)
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", api_key)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&self.audio_path, &bytes).await {
                        warn!("failed to store tts audio: {e}");
                    } else {
                        debug!(path = %self.audio_path.display(), "tts audio stored");
                    }
                }
                Err(e) => warn!("failed to read tts audio: {e}"),
            },
            Ok(resp) => warn!(status = %resp.status(), "tts call failed"),
            Err(e) => warn!("tts request failed: {e}"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_unescapes_control_sequences() {
        assert_eq!(TtsClient::preprocess("a\\nb"), "a\nb");
        assert_eq!(TtsClient::preprocess("it\\'s"), "it's");
    }

    #[tokio::test]
    async fn inactive_client_is_a_noop() {
        let client = TtsClient::from_settings(&TtsSettings::default());
        // Must return without any network access.
        client.speak("hello").await;
    }

    #[tokio::test]
    async fn active_but_unconfigured_client_tolerates_missing_endpoint() {
        let client = TtsClient::from_settings(&TtsSettings {
            active: true,
            url: None,
            api_key_env: None,
        });
        client.speak("hello").await;
    }
}
