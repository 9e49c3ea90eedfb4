// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver for the native Generative Language API.
//!
//! Uses the non-streaming `generateContent` endpoint: every model
//! interaction in this system is a single-shot call whose reply is either
//! function calls or text.
//!
//! # Auth
//! API key via `?key=...` query param, read from `GEMINI_API_KEY`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{FunctionCall, ModelInvoker, ModelRequest, ModelResponse, RequestPart};

pub struct GoogleInvoker {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleInvoker {
    /// Fails fast when the API key is absent: a missing key is a
    /// configuration error, not something to discover mid-session.
    pub fn new(model: impl Into<String>) -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .context("GEMINI_API_KEY not set")?;
        Ok(Self {
            model: model.into(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com".into(),
            client: reqwest::Client::new(),
        })
    }

    fn build_body(req: &ModelRequest) -> Value {
        let parts: Vec<Value> = req
            .parts
            .iter()
            .map(|p| match p {
                RequestPart::Text(t) => json!({ "text": t }),
                RequestPart::Image { mime, data_b64 } => json!({
                    "inline_data": { "mime_type": mime, "data": data_b64 }
                }),
            })
            .collect();

        let mut body = json!({
            "contents": [{ "role": "user", "parts": parts }],
        });

        if let Some(system) = &req.system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if let Some(cfg) = &req.config {
            body["generationConfig"] = json!({
                "temperature": cfg.temperature,
                "topP": cfg.top_p,
                "topK": cfg.top_k,
                "maxOutputTokens": cfg.max_output_tokens,
            });
        }
        if !req.tools.is_empty() {
            let decls: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }
        body
    }

    fn parse_response(v: &Value) -> ModelResponse {
        let mut text = String::new();
        let mut calls = Vec::new();

        if let Some(parts) = v["candidates"][0]["content"]["parts"].as_array() {
            for part in parts {
                if let Some(fc) = part.get("functionCall") {
                    calls.push(FunctionCall {
                        name: fc["name"].as_str().unwrap_or("").to_string(),
                        args: fc.get("args").cloned().unwrap_or_else(|| json!({})),
                    });
                } else if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
            }
        }
        ModelResponse {
            text,
            function_calls: calls,
        }
    }
}

#[async_trait]
impl ModelInvoker for GoogleInvoker {
    fn name(&self) -> &str {
        "google"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: ModelRequest) -> anyhow::Result<ModelResponse> {
        let body = Self::build_body(&req);
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        );

        debug!(model = %self.model, tools = req.tools.len(), "sending Gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Gemini error {status}: {text}");
        }

        let v: Value = resp.json().await.context("decoding Gemini response")?;
        Ok(Self::parse_response(&v))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
