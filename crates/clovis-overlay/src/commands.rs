// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Overlay wire protocol: one JSON frame per message.
//!
//! Outbound frames are tagged with `command`, inbound frames with `event`.
//! Field names mirror the renderer's JavaScript conventions (`fontSize`,
//! `strokeWidth`, `requestId`), so several fields carry serde renames.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::theme::Theme;

/// A command shipped to the overlay renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OverlayCommand {
    DrawBox {
        id: String,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        #[serde(rename = "strokeWidth")]
        stroke_width: u32,
        opacity: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        stroke: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fill: Option<String>,
        #[serde(rename = "autoContrast", default, skip_serializing_if = "std::ops::Not::not")]
        auto_contrast: bool,
    },
    DrawText {
        id: String,
        x: f64,
        y: f64,
        text: String,
        #[serde(rename = "fontSize")]
        font_size: u32,
        #[serde(rename = "fontFamily")]
        font_family: String,
        align: String,
        baseline: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<Theme>,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    DrawDot {
        id: String,
        x: f64,
        y: f64,
        radius: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    RemoveBox { id: String },
    RemoveText { id: String },
    RemoveDot { id: String },
    Clear,
    ShowStatusBubble {
        text: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<Theme>,
    },
    UpdateStatusBubble {
        text: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<Theme>,
    },
    CompleteStatusBubble {
        #[serde(rename = "responseText")]
        response_text: String,
        #[serde(rename = "doneText")]
        done_text: String,
        #[serde(rename = "delayMs")]
        delay_ms: u64,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<Theme>,
    },
    HideStatusBubble {
        #[serde(default)]
        delay: u64,
    },
    ShowCursorStatus {
        text: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<Theme>,
    },
    UpdateCursorStatus {
        text: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        theme: Option<Theme>,
    },
    HideCursorStatus,
    SetCursorStatusPosition { x: f64, y: f64 },
    ShowCommandOverlay,
    OverlayHide,
    SetModelName { name: String },
    SetBackground { color: String },
}

impl OverlayCommand {
    /// The stateful entity id this command creates or removes, if any.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::DrawBox { id, .. }
            | Self::DrawText { id, .. }
            | Self::DrawDot { id, .. }
            | Self::RemoveBox { id }
            | Self::RemoveText { id }
            | Self::RemoveDot { id } => Some(id),
            _ => None,
        }
    }
}

/// An event received from the overlay renderer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    OverlayInput {
        #[serde(default)]
        text: String,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
    },
    Viewport { width: u32, height: u32 },
    CaptureScreenshot {
        /// Optional data-URL frame pushed by the renderer.  Undecodable
        /// frames are dropped silently.
        #[serde(default)]
        data: Option<String>,
    },
    StopAll,
    Click { id: String },
}

/// Anything that can accept overlay commands: the live WebSocket server in
/// production, a recording sink in tests.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send(&self, command: OverlayCommand);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_box_serializes_renderer_field_names() {
        let cmd = OverlayCommand::DrawBox {
            id: "box_1".into(),
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 50.0,
            stroke_width: 5,
            opacity: 0.8,
            stroke: None,
            fill: None,
            auto_contrast: true,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\":\"draw_box\""));
        assert!(json.contains("\"strokeWidth\":5"));
        assert!(json.contains("\"autoContrast\":true"));
        assert!(!json.contains("stroke\":null"));
    }

    #[test]
    fn auto_contrast_false_is_omitted() {
        let cmd = OverlayCommand::DrawBox {
            id: "b".into(),
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            stroke_width: 5,
            opacity: 0.8,
            stroke: Some("#73e331".into()),
            fill: None,
            auto_contrast: false,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("autoContrast"));
    }

    #[test]
    fn complete_status_bubble_uses_camel_case() {
        let cmd = OverlayCommand::CompleteStatusBubble {
            response_text: "All done".into(),
            done_text: "Task done".into(),
            delay_ms: 2000,
            source: "rapid".into(),
            theme: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"responseText\":\"All done\""));
        assert!(json.contains("\"doneText\":\"Task done\""));
        assert!(json.contains("\"delayMs\":2000"));
    }

    #[test]
    fn entity_id_for_draw_and_remove() {
        let draw = OverlayCommand::DrawDot {
            id: "dot_1".into(),
            x: 0.0,
            y: 0.0,
            radius: 6.0,
            color: None,
        };
        assert_eq!(draw.entity_id(), Some("dot_1"));
        assert_eq!(OverlayCommand::Clear.entity_id(), None);
    }

    #[test]
    fn inbound_overlay_input_parses_request_id() {
        let ev: InboundEvent = serde_json::from_str(
            r#"{"event":"overlay_input","text":"open spotify","requestId":"r-1"}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            InboundEvent::OverlayInput {
                text: "open spotify".into(),
                request_id: Some("r-1".into()),
            }
        );
    }

    #[test]
    fn inbound_viewport_parses() {
        let ev: InboundEvent =
            serde_json::from_str(r#"{"event":"viewport","width":2560,"height":1440}"#).unwrap();
        assert_eq!(ev, InboundEvent::Viewport { width: 2560, height: 1440 });
    }

    #[test]
    fn inbound_capture_without_data_parses() {
        let ev: InboundEvent =
            serde_json::from_str(r#"{"event":"capture_screenshot"}"#).unwrap();
        assert_eq!(ev, InboundEvent::CaptureScreenshot { data: None });
    }
}
