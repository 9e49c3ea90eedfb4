// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Screen-Judge: one-shot multimodal routing context.
//!
//! A single model call over the stored screenshot returns a strict JSON
//! object the router attaches to its session.  Near-JSON replies are
//! recovered with the parse / bracket-extract / parse policy; every field
//! is trimmed, bounded, and validated before it reaches a prompt.

use image::RgbImage;
use serde_json::Value;
use tracing::debug;

use clovis_model::{parse_loose_json, GenerationConfig, ModelInvoker, ModelRequest, RequestPart};

/// Upper bound applied to every string field.
const FIELD_MAX_CHARS: usize = 420;

const ALLOWED_AGENTS: &[&str] = &["cua_cli", "cua_vision", "browser", "clovis", "direct", ""];

/// Routing context extracted from the current screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScreenContext {
    pub summary: String,
    pub repo_url: String,
    pub local_url: String,
    pub recommended_agent: String,
    pub recommended_task: String,
    pub hints: String,
    /// Model that produced this context.
    pub model: String,
}

impl ScreenContext {
    /// Render into the router's chain-state block.
    pub fn render_for_prompt(&self) -> String {
        let mut lines = vec![format!("Screen summary: {}", self.summary)];
        if !self.repo_url.is_empty() {
            lines.push(format!("Visible repo URL: {}", self.repo_url));
        }
        if !self.local_url.is_empty() {
            lines.push(format!("Visible local URL: {}", self.local_url));
        }
        if !self.recommended_agent.is_empty() {
            lines.push(format!("Recommended agent: {}", self.recommended_agent));
        }
        if !self.recommended_task.is_empty() {
            lines.push(format!("Recommended task: {}", self.recommended_task));
        }
        if !self.hints.is_empty() {
            lines.push(format!("Hints: {}", self.hints));
        }
        lines.join("\n")
    }
}

fn bound(value: &str) -> String {
    let trimmed = value.trim();
    trimmed.chars().take(FIELD_MAX_CHARS).collect()
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).map(bound).unwrap_or_default()
}

/// One-shot multimodal analyzer.
pub struct ScreenJudge;

impl ScreenJudge {
    fn build_prompt(user_request: &str, focus: &str) -> String {
        let focus_line = if focus.trim().is_empty() {
            String::new()
        } else {
            format!("\nExtraction focus: {}\n", focus.trim())
        };
        format!(
            "Analyze the attached screenshot to help route this user request:\n\
             {user_request}\n{focus_line}\n\
             Respond with ONLY a JSON object, no prose, exactly these keys:\n\
             {{\n\
               \"summary\": \"one or two sentences about what is visible\",\n\
               \"repo_url\": \"repository URL visible on screen, or empty\",\n\
               \"local_url\": \"localhost/127.0.0.1 URL visible on screen, or empty\",\n\
               \"recommended_agent\": \"one of cua_cli | cua_vision | browser | clovis | direct, or empty\",\n\
               \"recommended_task\": \"the concrete next task, or empty\",\n\
               \"hints\": \"anything else useful for routing, or empty\"\n\
             }}"
        )
    }

    /// Normalize the raw model reply into a usable context.
    fn normalize(
        parsed: Option<Value>,
        raw_text: &str,
        user_request: &str,
        model_name: &str,
    ) -> ScreenContext {
        let v = parsed.unwrap_or(Value::Null);
        let mut ctx = ScreenContext {
            summary: str_field(&v, "summary"),
            repo_url: str_field(&v, "repo_url"),
            local_url: str_field(&v, "local_url"),
            recommended_agent: str_field(&v, "recommended_agent"),
            recommended_task: str_field(&v, "recommended_task"),
            hints: str_field(&v, "hints"),
            model: model_name.to_string(),
        };
        if !ALLOWED_AGENTS.contains(&ctx.recommended_agent.as_str()) {
            ctx.recommended_agent = String::new();
        }
        if ctx.recommended_task.is_empty() {
            ctx.recommended_task = bound(user_request);
        }
        if ctx.summary.is_empty() {
            // Fall back to whatever the model actually said.
            ctx.summary = bound(raw_text);
            if ctx.summary.is_empty() {
                ctx.summary = "Screen context captured".into();
            }
        }
        ctx
    }

    /// Run the judge.  A thrown error becomes a failed chain step upstream.
    pub async fn analyze(
        model: &dyn ModelInvoker,
        user_request: &str,
        focus: &str,
        screenshot: Option<&RgbImage>,
    ) -> anyhow::Result<ScreenContext> {
        let mut request = ModelRequest::from_text(Self::build_prompt(user_request, focus))
            .with_config(GenerationConfig::default());
        if let Some(image) = screenshot {
            let mut bytes = Vec::new();
            image
                .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
                .map_err(|e| anyhow::anyhow!("encoding screenshot: {e}"))?;
            request.parts.insert(0, RequestPart::png(&bytes));
        }

        let response = model.generate(request).await?;
        let parsed = parse_loose_json(&response.text);
        if parsed.is_none() {
            debug!("screen judge reply was not JSON, synthesizing summary");
        }
        Ok(Self::normalize(
            parsed,
            &response.text,
            user_request,
            model.model_name(),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clovis_model::{ModelResponse, ScriptedInvoker};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn clean_json_reply_is_parsed() {
        let reply = json!({
            "summary": "GitHub repo page is visible.",
            "repo_url": "https://github.com/example/repo",
            "local_url": "",
            "recommended_agent": "cua_cli",
            "recommended_task": "Clone the repo and start the local server.",
            "hints": "Repo URL visible in address bar."
        });
        let model = ScriptedInvoker::new(vec![ModelResponse::from_text(reply.to_string())]);
        let ctx = ScreenJudge::analyze(&model, "clone this repo", "", None)
            .await
            .unwrap();
        assert_eq!(ctx.repo_url, "https://github.com/example/repo");
        assert_eq!(ctx.recommended_agent, "cua_cli");
        assert_eq!(ctx.model, "scripted-mock-model");
    }

    #[tokio::test]
    async fn fenced_json_is_recovered() {
        let model = ScriptedInvoker::new(vec![ModelResponse::from_text(
            "```json\n{\"summary\": \"A code editor\", \"recommended_agent\": \"cua_vision\"}\n```",
        )]);
        let ctx = ScreenJudge::analyze(&model, "click run", "", None).await.unwrap();
        assert_eq!(ctx.summary, "A code editor");
        assert_eq!(ctx.recommended_agent, "cua_vision");
    }

    #[tokio::test]
    async fn disallowed_agent_is_dropped() {
        let model = ScriptedInvoker::new(vec![ModelResponse::from_text(
            r#"{"summary": "x", "recommended_agent": "terminator"}"#,
        )]);
        let ctx = ScreenJudge::analyze(&model, "x", "", None).await.unwrap();
        assert_eq!(ctx.recommended_agent, "");
    }

    #[tokio::test]
    async fn empty_task_defaults_to_user_request() {
        let model = ScriptedInvoker::new(vec![ModelResponse::from_text(
            r#"{"summary": "a desktop"}"#,
        )]);
        let ctx = ScreenJudge::analyze(&model, "open my project", "", None)
            .await
            .unwrap();
        assert_eq!(ctx.recommended_task, "open my project");
    }

    #[tokio::test]
    async fn non_json_reply_synthesizes_summary() {
        let model = ScriptedInvoker::new(vec![ModelResponse::from_text(
            "The screen shows a browser with the docs open.",
        )]);
        let ctx = ScreenJudge::analyze(&model, "x", "", None).await.unwrap();
        assert_eq!(ctx.summary, "The screen shows a browser with the docs open.");
    }

    #[tokio::test]
    async fn long_fields_are_bounded() {
        let long = "s".repeat(1000);
        let model = ScriptedInvoker::new(vec![ModelResponse::from_text(
            json!({ "summary": long }).to_string(),
        )]);
        let ctx = ScreenJudge::analyze(&model, "x", "", None).await.unwrap();
        assert_eq!(ctx.summary.chars().count(), 420);
    }

    #[test]
    fn prompt_render_skips_empty_fields() {
        let ctx = ScreenContext {
            summary: "A repo page".into(),
            repo_url: "https://github.com/x/y".into(),
            ..Default::default()
        };
        let rendered = ctx.render_for_prompt();
        assert!(rendered.contains("Screen summary: A repo page"));
        assert!(rendered.contains("Visible repo URL"));
        assert!(!rendered.contains("Recommended agent"));
    }
}
