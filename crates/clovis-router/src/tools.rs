// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Router tool set and decision parsing.

use serde_json::json;

use clovis_model::{ModelResponse, ToolDecl};

/// The execution backends a chain step can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Clovis,
    Browser,
    CuaCli,
    CuaVision,
    ScreenContext,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clovis => "clovis",
            Self::Browser => "browser",
            Self::CuaCli => "cua_cli",
            Self::CuaVision => "cua_vision",
            Self::ScreenContext => "screen_context",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clovis" => Some(Self::Clovis),
            "browser" => Some(Self::Browser),
            "cua_cli" => Some(Self::CuaCli),
            "cua_vision" => Some(Self::CuaVision),
            "screen_context" => Some(Self::ScreenContext),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One router step, as decided by the rapid response model.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// Terminal user-visible answer.
    Direct { text: String },
    /// Delegate one task to an execution agent.
    Invoke { agent: AgentKind, task: String },
    /// One-shot screen-context read before further routing.
    ScreenContext { task: String, focus: String },
}

fn task_decl(name: &str, description: &str) -> ToolDecl {
    ToolDecl {
        name: name.into(),
        description: description.into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task, preserving the user's original wording and context"
                }
            },
            "required": ["task"]
        }),
    }
}

/// The fixed router tool set.
pub fn router_tool_decls() -> Vec<ToolDecl> {
    vec![
        ToolDecl {
            name: "direct_response".into(),
            description: "Answer the user immediately, or conclude a multi-step run.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "The final answer" }
                },
                "required": ["text"]
            }),
        },
        task_decl(
            "invoke_clovis",
            "Annotate/explain things on the user's screen. Explanation only, never execution.",
        ),
        task_decl("invoke_browser", "Web automation tasks in the browser."),
        task_decl("invoke_cua_cli", "Shell-based desktop control (commands, files, servers)."),
        task_decl("invoke_cua_vision", "GUI-based desktop control (clicking, typing, navigation)."),
        ToolDecl {
            name: "request_screen_context".into(),
            description: "One-shot screenshot context extraction for routing (visible URLs, \
                          relevant UI state)."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string", "description": "The user task being routed" },
                    "focus": { "type": "string", "description": "What to extract from the screen" }
                }
            }),
        },
    ]
}

impl RoutingDecision {
    /// Interpret one model response.  `None` is the invalid-shape case:
    /// no recognizable tool call and no usable text.
    pub fn from_response(response: &ModelResponse, user_prompt: &str) -> Option<Self> {
        if let Some(call) = response.function_calls.first() {
            let task = call
                .str_arg("task")
                .or_else(|| call.str_arg("query"))
                .unwrap_or(user_prompt)
                .to_string();
            return match call.name.as_str() {
                "direct_response" => Some(Self::Direct {
                    text: call.str_arg("text").unwrap_or_default().to_string(),
                }),
                "invoke_clovis" => Some(Self::Invoke { agent: AgentKind::Clovis, task }),
                "invoke_browser" => Some(Self::Invoke { agent: AgentKind::Browser, task }),
                "invoke_cua_cli" => Some(Self::Invoke { agent: AgentKind::CuaCli, task }),
                "invoke_cua_vision" => Some(Self::Invoke { agent: AgentKind::CuaVision, task }),
                "request_screen_context" => Some(Self::ScreenContext {
                    task,
                    focus: call.str_arg("focus").unwrap_or_default().to_string(),
                }),
                _ => None,
            };
        }
        let text = response.text.trim();
        if text.is_empty() {
            None
        } else {
            Some(Self::Direct { text: text.to_string() })
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clovis_model::FunctionCall;

    use super::*;

    fn response_with(name: &str, args: serde_json::Value) -> ModelResponse {
        ModelResponse::from_calls(vec![FunctionCall::new(name, args)])
    }

    #[test]
    fn direct_response_is_parsed() {
        let d = RoutingDecision::from_response(
            &response_with("direct_response", json!({"text": "4"})),
            "what is 2+2?",
        );
        assert_eq!(d, Some(RoutingDecision::Direct { text: "4".into() }));
    }

    #[test]
    fn invoke_tools_map_to_agents() {
        for (tool, agent) in [
            ("invoke_clovis", AgentKind::Clovis),
            ("invoke_browser", AgentKind::Browser),
            ("invoke_cua_cli", AgentKind::CuaCli),
            ("invoke_cua_vision", AgentKind::CuaVision),
        ] {
            let d = RoutingDecision::from_response(
                &response_with(tool, json!({"task": "do the thing"})),
                "original",
            );
            assert_eq!(
                d,
                Some(RoutingDecision::Invoke { agent, task: "do the thing".into() })
            );
        }
    }

    #[test]
    fn missing_task_falls_back_to_user_prompt() {
        let d = RoutingDecision::from_response(
            &response_with("invoke_cua_cli", json!({})),
            "clone this repo",
        );
        assert_eq!(
            d,
            Some(RoutingDecision::Invoke {
                agent: AgentKind::CuaCli,
                task: "clone this repo".into()
            })
        );
    }

    #[test]
    fn screen_context_carries_focus() {
        let d = RoutingDecision::from_response(
            &response_with(
                "request_screen_context",
                json!({"task": "clone it", "focus": "extract repo url"}),
            ),
            "clone it",
        );
        assert_eq!(
            d,
            Some(RoutingDecision::ScreenContext {
                task: "clone it".into(),
                focus: "extract repo url".into()
            })
        );
    }

    #[test]
    fn unknown_tool_is_invalid_shape() {
        let d = RoutingDecision::from_response(
            &response_with("explode", json!({})),
            "x",
        );
        assert_eq!(d, None);
    }

    #[test]
    fn empty_response_is_invalid_shape() {
        assert_eq!(
            RoutingDecision::from_response(&ModelResponse::default(), "x"),
            None
        );
    }

    #[test]
    fn plain_text_reply_is_direct() {
        let d = RoutingDecision::from_response(&ModelResponse::from_text(" hello "), "x");
        assert_eq!(d, Some(RoutingDecision::Direct { text: "hello".into() }));
    }

    #[test]
    fn agent_kind_round_trips() {
        for kind in [
            AgentKind::Clovis,
            AgentKind::Browser,
            AgentKind::CuaCli,
            AgentKind::CuaVision,
            AgentKind::ScreenContext,
        ] {
            assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AgentKind::parse("direct"), None);
    }
}
