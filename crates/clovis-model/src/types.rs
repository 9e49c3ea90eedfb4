// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Request types ────────────────────────────────────────────────────────────

/// One part of a model request: plain text or an inline image.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPart {
    Text(String),
    /// Base64-encoded image bytes with their mime type.
    Image { mime: String, data_b64: String },
}

impl RequestPart {
    pub fn text(t: impl Into<String>) -> Self {
        Self::Text(t.into())
    }

    /// PNG bytes → inline image part.
    pub fn png(bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self::Image {
            mime: "image/png".into(),
            data_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// A tool made available to the model for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

impl ToolDecl {
    /// Parameter names declared in the schema's `properties` object.
    ///
    /// Engines use this to filter out metadata keys (`status_text`,
    /// `target_description`) the model attaches to calls before dispatching
    /// into a concrete function.
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Sampling parameters.  Low-temperature configs are used for screen
/// interaction, higher for analysis, mirroring how each caller tunes its
/// own calls.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 3000,
        }
    }
}

impl GenerationConfig {
    /// Tight config for action selection (consistent positioning/clicking).
    pub fn interaction() -> Self {
        Self {
            temperature: 0.2,
            max_output_tokens: 100,
            ..Self::default()
        }
    }

    /// Config for one-shot localization replies (a single bbox line).
    pub fn locator() -> Self {
        Self {
            temperature: 0.1,
            max_output_tokens: 64,
            ..Self::default()
        }
    }
}

/// A single-shot model request: ordered parts, optional tool declarations.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system_instruction: Option<String>,
    pub parts: Vec<RequestPart>,
    pub tools: Vec<ToolDecl>,
    pub config: Option<GenerationConfig>,
}

impl ModelRequest {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![RequestPart::text(text)],
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDecl>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn push_image(&mut self, mime: impl Into<String>, data_b64: impl Into<String>) {
        self.parts.push(RequestPart::Image {
            mime: mime.into(),
            data_b64: data_b64.into(),
        });
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

/// One function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Argument object as returned by the provider (always a JSON object).
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self { name: name.into(), args }
    }

    /// String argument accessor, trimmed; `None` when absent or empty.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn f64_arg(&self, key: &str) -> Option<f64> {
        self.args.get(key).and_then(Value::as_f64)
    }

    pub fn bool_arg(&self, key: &str) -> Option<bool> {
        self.args.get(key).and_then(Value::as_bool)
    }
}

/// Restrict a call's arguments to the tool's declared parameter set.
///
/// Models attach metadata keys and occasional inventions to calls; engines
/// dispatch only what the concrete function signature declares.  An unknown
/// tool filters to an empty object.
pub fn filter_declared_args(call: &FunctionCall, decls: &[ToolDecl]) -> Value {
    let declared: Vec<String> = decls
        .iter()
        .find(|d| d.name == call.name)
        .map(|d| d.parameter_names())
        .unwrap_or_default();
    let mut out = serde_json::Map::new();
    if let Some(args) = call.args.as_object() {
        for (key, value) in args {
            if declared.iter().any(|d| d == key) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

/// What one model call produced: free text, function calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
}

impl ModelResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            function_calls: Vec::new(),
        }
    }

    pub fn from_calls(calls: Vec<FunctionCall>) -> Self {
        Self {
            text: String::new(),
            function_calls: calls,
        }
    }

    pub fn has_calls(&self) -> bool {
        !self.function_calls.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_decl_lists_parameter_names() {
        let decl = ToolDecl {
            name: "go_to_element".into(),
            description: "".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "ymin": {"type": "number"},
                    "xmin": {"type": "number"},
                    "target_description": {"type": "string"}
                }
            }),
        };
        let mut names = decl.parameter_names();
        names.sort();
        assert_eq!(names, vec!["target_description", "xmin", "ymin"]);
    }

    #[test]
    fn tool_decl_without_properties_has_no_names() {
        let decl = ToolDecl {
            name: "task_is_complete".into(),
            description: "".into(),
            parameters: json!({"type": "object"}),
        };
        assert!(decl.parameter_names().is_empty());
    }

    #[test]
    fn function_call_str_arg_trims_and_filters_empty() {
        let call = FunctionCall::new("f", json!({"a": "  x  ", "b": "   "}));
        assert_eq!(call.str_arg("a"), Some("x"));
        assert_eq!(call.str_arg("b"), None);
        assert_eq!(call.str_arg("missing"), None);
    }

    #[test]
    fn function_call_numeric_arg() {
        let call = FunctionCall::new("f", json!({"y": 412, "r": 0.5}));
        assert_eq!(call.f64_arg("y"), Some(412.0));
        assert_eq!(call.f64_arg("r"), Some(0.5));
    }

    #[test]
    fn png_part_is_base64() {
        let part = RequestPart::png(&[1, 2, 3]);
        match part {
            RequestPart::Image { mime, data_b64 } => {
                assert_eq!(mime, "image/png");
                assert_eq!(data_b64, "AQID");
            }
            _ => panic!("expected image part"),
        }
    }

    #[test]
    fn interaction_config_is_tight() {
        let c = GenerationConfig::interaction();
        assert!(c.temperature < 0.5);
        assert_eq!(c.max_output_tokens, 100);
    }
}
