// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Screen annotation agent.
//!
//! One model call with the current screenshot; the reply is a sequence of
//! timed annotation tool calls (boxes, text labels, pointer dots, clears)
//! that are enqueued on the draw action queue, or a direct text response.
//! Execution requests never come here: this agent explains, it does not
//! act.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use clovis_model::{
    filter_declared_args, FunctionCall, ModelInvoker, ModelRequest, RequestPart, ToolDecl,
};
use clovis_overlay::{CommandSink, DrawAction, DrawQueue, OverlayCommand};

use crate::vision::ScreenCapture;
use crate::{Agent, StepOutcome};

const CLOVIS_SYSTEM_PROMPT: &str = "\
You are CLOVIS, a screen annotation assistant. You receive a screenshot of
the user's screen and a question about it. You explain what is on screen by
drawing timed annotations with the tools provided, or by answering directly
with `direct_response` for simple questions.

RULES:
- Coordinates are [ymin, xmin, ymax, xmax] boxes or (x, y) points,
  normalized to 0-1000 against the screen.
- Use `time_offset` (seconds) to sequence annotations into a guided tour;
  offsets must not decrease within one response.
- Keep text labels short. Point with dots, frame with boxes.
- Use `clear_screen` before a new explanation sequence when the screen is
  already annotated.
- For plain questions that need no drawing, call `direct_response` once.";

fn number(desc: &str) -> Value {
    json!({ "type": "number", "description": desc })
}

fn annotation_tool_decls() -> Vec<ToolDecl> {
    let time_offset = number("Seconds from sequence start to run this action");
    vec![
        ToolDecl {
            name: "draw_bounding_box".into(),
            description: "Draw a box around a screen region (0-1000 coords).".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "y_min": number("Top edge"),
                    "x_min": number("Left edge"),
                    "y_max": number("Bottom edge"),
                    "x_max": number("Right edge"),
                    "time_offset": time_offset
                },
                "required": ["y_min", "x_min", "y_max", "x_max"]
            }),
        },
        ToolDecl {
            name: "create_text".into(),
            description: "Draw a short text label anchored at a point.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "x": number("Anchor x"),
                    "y": number("Anchor y"),
                    "text": { "type": "string" },
                    "time_offset": time_offset
                },
                "required": ["x", "y", "text"]
            }),
        },
        ToolDecl {
            name: "draw_dot".into(),
            description: "Draw a pointer dot at a point.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "x": number("Dot x"),
                    "y": number("Dot y"),
                    "time_offset": time_offset
                },
                "required": ["x", "y"]
            }),
        },
        ToolDecl {
            name: "clear_screen".into(),
            description: "Remove every annotation currently on screen.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "time_offset": time_offset }
            }),
        },
        ToolDecl {
            name: "direct_response".into(),
            description: "Answer the user directly without drawing.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        },
    ]
}

pub struct ClovisAgent {
    model: Arc<dyn ModelInvoker>,
    queue: Arc<DrawQueue>,
    sink: Arc<dyn CommandSink>,
    capture: Option<Arc<dyn ScreenCapture>>,
    decls: Vec<ToolDecl>,
}

impl ClovisAgent {
    pub fn new(
        model: Arc<dyn ModelInvoker>,
        queue: Arc<DrawQueue>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        Self {
            model,
            queue,
            sink,
            capture: None,
            decls: annotation_tool_decls(),
        }
    }

    pub fn with_capture(mut self, capture: Arc<dyn ScreenCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Convert one annotation call into a queued draw action.
    fn action_for(call: &FunctionCall, args: &Value) -> anyhow::Result<DrawAction> {
        let num = |key: &str| -> anyhow::Result<f64> {
            args.get(key)
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow::anyhow!("argument '{key}' missing for {}", call.name))
        };
        match call.name.as_str() {
            "draw_bounding_box" => Ok(DrawAction::BoundingBox {
                y_min: num("y_min")?,
                x_min: num("x_min")?,
                y_max: num("y_max")?,
                x_max: num("x_max")?,
                id: None,
                stroke: None,
                stroke_width: 5,
                opacity: 0.8,
                auto_contrast: true,
                fill: None,
            }),
            "create_text" => Ok(DrawAction::Text {
                x: num("x")?,
                y: num("y")?,
                text: args
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                id: None,
                font_size: 16,
                align: "center".into(),
                baseline: "middle".into(),
                source: Some("clovis".into()),
            }),
            "draw_dot" => Ok(DrawAction::Dot {
                x: num("x")?,
                y: num("y")?,
                radius: 6.0,
                color: None,
                id: None,
            }),
            "clear_screen" => Ok(DrawAction::Clear),
            "direct_response" => Ok(DrawAction::DirectResponse {
                text: args
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                source: Some("clovis".into()),
            }),
            other => anyhow::bail!("unknown tool: {other}"),
        }
    }
}

#[async_trait]
impl Agent for ClovisAgent {
    fn source(&self) -> &'static str {
        "clovis"
    }

    async fn execute(&self, task: &str) -> StepOutcome {
        self.sink
            .send(OverlayCommand::SetModelName {
                name: self.model.model_name().to_string(),
            })
            .await;

        let prompt = format!("{CLOVIS_SYSTEM_PROMPT}\n# User's Request:\n{task}");
        let mut request = ModelRequest::from_text(prompt).with_tools(self.decls.clone());
        if let Some(capture) = &self.capture {
            match capture.capture_active_window() {
                Ok((screenshot, _ctx)) => match crate::vision::png_bytes(&screenshot) {
                    Ok(bytes) => request.parts.push(RequestPart::png(&bytes)),
                    Err(e) => warn!("screenshot encode failed: {e}"),
                },
                Err(e) => warn!("annotation capture unavailable: {e}"),
            }
        }

        let response = match self.model.generate(request).await {
            Ok(response) => response,
            Err(e) => return StepOutcome::failed(self.source(), e.to_string()),
        };

        let mut scheduled = 0usize;
        for call in &response.function_calls {
            let args = filter_declared_args(call, &self.decls);
            let offset = args
                .get("time_offset")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .max(0.0);
            match Self::action_for(call, &args) {
                Ok(action) => {
                    debug!(tool = %call.name, offset, "scheduling annotation");
                    self.queue.schedule(offset, action).await;
                    scheduled += 1;
                }
                Err(e) => return StepOutcome::failed(self.source(), e.to_string()),
            }
        }

        let message = if !response.text.trim().is_empty() {
            response.text.trim().to_string()
        } else if scheduled > 0 {
            format!("Annotated the screen with {scheduled} action(s).")
        } else {
            "No annotations were produced.".to_string()
        };
        StepOutcome::ok(self.source(), message)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
