// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::{FunctionCall, ModelInvoker, ModelRequest, ModelResponse};

/// A pre-scripted invoker.  Each `generate` call pops the next response
/// from the front of the queue, letting tests specify exact sequences
/// (including function calls) without network access.
pub struct ScriptedInvoker {
    scripts: Arc<Mutex<Vec<ModelResponse>>>,
    /// Every request seen, in order, so tests can inspect prompts.
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedInvoker {
    pub fn new(scripts: Vec<ModelResponse>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: invoker that always returns the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![ModelResponse::from_text(r)])
    }

    /// Convenience: one response holding a single named function call.
    pub fn single_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self::new(vec![ModelResponse::from_calls(vec![FunctionCall::new(
            name, args,
        )])])
    }

    /// Number of `generate` calls made so far.
    pub fn calls_made(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn generate(&self, req: ModelRequest) -> anyhow::Result<ModelResponse> {
        self.requests.lock().unwrap().push(req);
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Default fallback when all scripts are consumed.
            return Ok(ModelResponse::from_calls(vec![FunctionCall::new(
                "direct_response",
                json!({ "text": "done" }),
            )]));
        }
        Ok(scripts.remove(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_pops_in_order() {
        let inv = ScriptedInvoker::new(vec![
            ModelResponse::from_text("first"),
            ModelResponse::from_text("second"),
        ]);
        let a = inv.generate(ModelRequest::from_text("x")).await.unwrap();
        let b = inv.generate(ModelRequest::from_text("y")).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert_eq!(inv.calls_made(), 2);
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back_to_direct_done() {
        let inv = ScriptedInvoker::new(vec![]);
        let r = inv.generate(ModelRequest::from_text("x")).await.unwrap();
        assert_eq!(r.function_calls[0].name, "direct_response");
        assert_eq!(r.function_calls[0].str_arg("text"), Some("done"));
    }

    #[tokio::test]
    async fn requests_are_recorded_for_inspection() {
        let inv = ScriptedInvoker::always_text("hi");
        inv.generate(ModelRequest::from_text("what is 2+2?"))
            .await
            .unwrap();
        let reqs = inv.requests.lock().unwrap();
        match &reqs[0].parts[0] {
            crate::RequestPart::Text(t) => assert_eq!(t, "what is 2+2?"),
            _ => panic!("expected text part"),
        }
    }
}
