// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Vision tool declarations and call classification.
//!
//! The declarations are the contract with the model; the engine enumerates
//! them, filters unknown arguments against each declared parameter set, and
//! dispatches only calls that pass.

use serde_json::json;

use clovis_model::ToolDecl;

pub const GO_TO_ELEMENT: &str = "go_to_element";
pub const CROP_AND_SEARCH: &str = "crop_and_search";
pub const CLICK_LEFT: &str = "click_left_click";
pub const CLICK_DOUBLE: &str = "click_double_left_click";
pub const CLICK_RIGHT: &str = "click_right_click";
pub const TYPE_STRING: &str = "type_string";
pub const PRESS_CTRL_HOTKEY: &str = "press_ctrl_hotkey";
pub const PRESS_ALT_HOTKEY: &str = "press_alt_hotkey";
pub const REMEMBER_INFORMATION: &str = "remember_information";
pub const TASK_IS_COMPLETE: &str = "task_is_complete";
pub const TTS_SPEAK: &str = "tts_speak";

/// Metadata keys the model attaches to calls; never forwarded to the
/// concrete function, never part of an action signature.
pub const TOOL_METADATA_KEYS: &[&str] = &["status_text", "target_description"];

pub fn is_positioning_tool(name: &str) -> bool {
    matches!(name, GO_TO_ELEMENT | CROP_AND_SEARCH)
}

pub fn is_click_tool(name: &str) -> bool {
    ClickKind::from_tool(name).is_some()
}

/// The three click flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickKind {
    Left,
    DoubleLeft,
    Right,
}

impl ClickKind {
    pub fn from_tool(name: &str) -> Option<Self> {
        match name {
            CLICK_LEFT => Some(Self::Left),
            CLICK_DOUBLE => Some(Self::DoubleLeft),
            CLICK_RIGHT => Some(Self::Right),
            _ => None,
        }
    }

    pub fn tool_name(self) -> &'static str {
        match self {
            Self::Left => CLICK_LEFT,
            Self::DoubleLeft => CLICK_DOUBLE,
            Self::Right => CLICK_RIGHT,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Left => "left click",
            Self::DoubleLeft => "double left click",
            Self::Right => "right click",
        }
    }

    /// Infer the click flavor from free text (task, status, target).
    pub fn infer_from_text(text: &str) -> Self {
        let lowered = text.to_lowercase();
        if lowered.contains("double click") || lowered.contains("double-click") {
            Self::DoubleLeft
        } else if lowered.contains("right click")
            || lowered.contains("right-click")
            || lowered.contains("context menu")
        {
            Self::Right
        } else {
            Self::Left
        }
    }
}

fn bbox_properties() -> serde_json::Value {
    json!({
        "ymin": { "type": "number", "description": "Top edge, 0-1000 normalized" },
        "xmin": { "type": "number", "description": "Left edge, 0-1000 normalized" },
        "ymax": { "type": "number", "description": "Bottom edge, 0-1000 normalized" },
        "xmax": { "type": "number", "description": "Right edge, 0-1000 normalized" },
        "status_text": { "type": "string", "description": "Short status for the UI" },
        "target_description": { "type": "string", "description": "Short label of the target" }
    })
}

fn click_decl(name: &str, description: &str) -> ToolDecl {
    ToolDecl {
        name: name.into(),
        description: description.into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "status_text": { "type": "string" },
                "target_description": { "type": "string" }
            }
        }),
    }
}

/// The fixed vision tool set.
pub fn vision_tool_decls() -> Vec<ToolDecl> {
    vec![
        ToolDecl {
            name: GO_TO_ELEMENT.into(),
            description: "Position the cursor at the center of the element inside the \
                          bounding box. Clicks are a separate step."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": bbox_properties(),
                "required": ["ymin", "xmin", "ymax", "xmax"]
            }),
        },
        ToolDecl {
            name: CROP_AND_SEARCH.into(),
            description: "Zoom into the bounding box and run a precision localization \
                          pass before positioning. Use when the target is tiny or crowded."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": bbox_properties(),
                "required": ["ymin", "xmin", "ymax", "xmax", "target_description"]
            }),
        },
        click_decl(CLICK_LEFT, "Left click at the current cursor location."),
        click_decl(CLICK_DOUBLE, "Double left click at the current cursor location."),
        click_decl(CLICK_RIGHT, "Right click at the current cursor location."),
        ToolDecl {
            name: TYPE_STRING.into(),
            description: "Type a string at the current focus; optionally submit with Enter.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "string": { "type": "string" },
                    "submit": { "type": "boolean" },
                    "status_text": { "type": "string" }
                },
                "required": ["string"]
            }),
        },
        ToolDecl {
            name: PRESS_CTRL_HOTKEY.into(),
            description: "Press the primary-modifier hotkey (Command on macOS, Ctrl elsewhere).".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "status_text": { "type": "string" }
                },
                "required": ["key"]
            }),
        },
        ToolDecl {
            name: PRESS_ALT_HOTKEY.into(),
            description: "Press an Alt/Option hotkey.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string" },
                    "status_text": { "type": "string" }
                },
                "required": ["key"]
            }),
        },
        ToolDecl {
            name: REMEMBER_INFORMATION.into(),
            description: "Store information for later steps. Without this you cannot \
                          remember anything between iterations."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "information": { "type": "string" },
                    "status_text": { "type": "string" }
                },
                "required": ["information"]
            }),
        },
        ToolDecl {
            name: TASK_IS_COMPLETE.into(),
            description: "Call when the user goal is fully satisfied. Terminal.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolDecl {
            name: TTS_SPEAK.into(),
            description: "Speak a short message to the user. Terminal.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        },
    ]
}

pub use clovis_model::filter_declared_args;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clovis_model::FunctionCall;

    use super::*;

    #[test]
    fn click_kinds_round_trip_through_tool_names() {
        for kind in [ClickKind::Left, ClickKind::DoubleLeft, ClickKind::Right] {
            assert_eq!(ClickKind::from_tool(kind.tool_name()), Some(kind));
        }
        assert_eq!(ClickKind::from_tool("type_string"), None);
    }

    #[test]
    fn click_inference_from_task_text() {
        assert_eq!(ClickKind::infer_from_text("double-click the file"), ClickKind::DoubleLeft);
        assert_eq!(ClickKind::infer_from_text("open the context menu"), ClickKind::Right);
        assert_eq!(ClickKind::infer_from_text("press the button"), ClickKind::Left);
    }

    #[test]
    fn tool_classification() {
        assert!(is_positioning_tool(GO_TO_ELEMENT));
        assert!(is_positioning_tool(CROP_AND_SEARCH));
        assert!(!is_positioning_tool(CLICK_LEFT));
        assert!(is_click_tool(CLICK_RIGHT));
        assert!(!is_click_tool(TASK_IS_COMPLETE));
    }

    #[test]
    fn declared_args_filter_drops_unknown_keys() {
        let decls = vision_tool_decls();
        let call = FunctionCall::new(
            TYPE_STRING,
            serde_json::json!({
                "string": "hello",
                "submit": true,
                "status_text": "Typing...",
                "x": 100,
                "confidence": 0.9
            }),
        );
        let filtered = filter_declared_args(&call, &decls);
        let keys: Vec<&String> = filtered.as_object().unwrap().keys().collect();
        assert!(keys.iter().any(|k| *k == "string"));
        assert!(keys.iter().any(|k| *k == "submit"));
        assert!(keys.iter().any(|k| *k == "status_text"));
        assert!(!keys.iter().any(|k| *k == "x"));
        assert!(!keys.iter().any(|k| *k == "confidence"));
    }

    #[test]
    fn unknown_tool_filters_to_empty_args() {
        let decls = vision_tool_decls();
        let call = FunctionCall::new("made_up_tool", serde_json::json!({ "a": 1 }));
        let filtered = filter_declared_args(&call, &decls);
        assert!(filtered.as_object().unwrap().is_empty());
    }

    #[test]
    fn every_decl_has_object_schema() {
        for decl in vision_tool_decls() {
            assert_eq!(decl.parameters["type"], "object", "{}", decl.name);
        }
    }
}
