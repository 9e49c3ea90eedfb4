// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The per-request router session.
//!
//! Turns one user prompt into up to `max_steps` delegated tool invocations
//! culminating in exactly one direct response.  Agents never throw across
//! this boundary; every failure arrives as a `StepOutcome` and becomes a
//! chain step.  The router is the sole emitter of user-visible text.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbImage;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use clovis_agents::Agent;
use clovis_model::{GenerationConfig, ModelInvoker, ModelRequest};
use clovis_overlay::{CommandSink, OverlayCommand};

use crate::judge::{ScreenContext, ScreenJudge};
use crate::memory::ConversationMemory;
use crate::prompts::{render_chain_state, router_system_prompt};
use crate::tools::{router_tool_decls, AgentKind, RoutingDecision};

/// Delegated steps allowed per session.
const MAX_STEPS: usize = 6;
/// A `(agent, normalized task)` signature reaching this count ends the
/// session.
const REPEAT_LIMIT: u32 = 3;
/// Bound applied to fallback direct responses built from error text.
const ERROR_TEXT_MAX_CHARS: usize = 420;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_steps: usize,
    pub repeat_limit: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS,
            repeat_limit: REPEAT_LIMIT,
        }
    }
}

/// A record of one delegated agent invocation.  Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    pub agent: AgentKind,
    pub task: String,
    pub success: bool,
    pub message: String,
    pub source: String,
}

/// What one session produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    /// The terminal direct response (exactly one per session).
    pub response: String,
    pub chain_steps: Vec<ChainStep>,
}

/// Provider of the most recent stored screenshot (the overlay cache).
pub trait ScreenshotSource: Send + Sync {
    fn latest(&self) -> Option<RgbImage>;
}

pub struct Router {
    model: Arc<dyn ModelInvoker>,
    judge_model: Arc<dyn ModelInvoker>,
    agents: HashMap<AgentKind, Arc<dyn Agent>>,
    memory: Mutex<ConversationMemory>,
    sink: Option<Arc<dyn CommandSink>>,
    screenshots: Option<Arc<dyn ScreenshotSource>>,
    personalization: Option<String>,
    config: RouterConfig,
}

impl Router {
    pub fn new(model: Arc<dyn ModelInvoker>, judge_model: Arc<dyn ModelInvoker>) -> Self {
        Self {
            model,
            judge_model,
            agents: HashMap::new(),
            memory: Mutex::new(ConversationMemory::new()),
            sink: None,
            screenshots: None,
            personalization: None,
            config: RouterConfig::default(),
        }
    }

    pub fn with_agent(mut self, kind: AgentKind, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(kind, agent);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_screenshots(mut self, source: Arc<dyn ScreenshotSource>) -> Self {
        self.screenshots = Some(source);
        self
    }

    pub fn with_personalization(mut self, personalization: Option<String>) -> Self {
        self.personalization = personalization;
        self
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Snapshot of conversation memory, for tests and diagnostics.
    pub async fn memory_snapshot(&self) -> Vec<crate::memory::MemoryEntry> {
        self.memory.lock().await.entries().cloned().collect()
    }

    async fn send(&self, command: OverlayCommand) {
        if let Some(sink) = &self.sink {
            sink.send(command).await;
        }
    }

    async fn update_status(&self, text: &str) {
        self.send(OverlayCommand::UpdateStatusBubble {
            text: text.into(),
            source: "rapid".into(),
            theme: None,
        })
        .await;
    }

    /// Run one complete session.  Exactly one terminal direct response is
    /// produced; every path funnels through `finish`.
    pub async fn run_session(&self, user_prompt: &str) -> SessionResult {
        info!(%user_prompt, "router session started");
        self.memory.lock().await.push_user(user_prompt);
        self.send(OverlayCommand::ShowStatusBubble {
            text: "Thinking...".into(),
            source: "rapid".into(),
            theme: None,
        })
        .await;

        let mut steps: Vec<ChainStep> = Vec::new();
        let mut signature_counts: HashMap<(AgentKind, String), u32> = HashMap::new();
        let mut screen_context: Option<ScreenContext> = None;
        let mut successful_steps = 0usize;

        let response = loop {
            if successful_steps >= self.config.max_steps {
                break format!(
                    "Stopped after {} steps without a final answer. \
                     Let me know how you'd like to continue.",
                    self.config.max_steps
                );
            }

            let request = self
                .build_request(user_prompt, &steps, screen_context.as_ref())
                .await;
            let model_response = match self.model.generate(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("router model call failed: {e:#}");
                    break bound_error_text(&format!("Router model call failed: {e}"));
                }
            };

            let decision = match RoutingDecision::from_response(&model_response, user_prompt) {
                Some(decision) => decision,
                None => break "Router returned an invalid response shape".to_string(),
            };

            match decision {
                RoutingDecision::Direct { text } => {
                    break sanitize_direct_response(&text, user_prompt, &steps);
                }
                RoutingDecision::ScreenContext { task, focus } => {
                    let signature = (AgentKind::ScreenContext, normalize_task(&task));
                    let count = signature_counts.entry(signature).or_insert(0);
                    *count += 1;
                    if *count >= self.config.repeat_limit {
                        break repeat_loop_response();
                    }

                    self.update_status("Reading the screen...").await;
                    let screenshot = self.screenshots.as_ref().and_then(|s| s.latest());
                    match ScreenJudge::analyze(
                        &*self.judge_model,
                        &task,
                        &focus,
                        screenshot.as_ref(),
                    )
                    .await
                    {
                        Ok(ctx) => {
                            debug!(summary = %ctx.summary, "screen context attached");
                            steps.push(ChainStep {
                                agent: AgentKind::ScreenContext,
                                task,
                                success: true,
                                message: ctx.summary.clone(),
                                source: "screen_context".into(),
                            });
                            self.memory
                                .lock()
                                .await
                                .push_assistant("screen_context", &ctx.summary);
                            screen_context = Some(ctx);
                            successful_steps += 1;
                        }
                        Err(e) => {
                            let message = bound_error_text(&e.to_string());
                            steps.push(ChainStep {
                                agent: AgentKind::ScreenContext,
                                task,
                                success: false,
                                message: message.clone(),
                                source: "screen_context".into(),
                            });
                            break format!(
                                "Stopping chained execution because screen_context failed: {message}"
                            );
                        }
                    }
                }
                RoutingDecision::Invoke { agent, task } => {
                    let signature = (agent, normalize_task(&task));
                    let count = signature_counts.entry(signature).or_insert(0);
                    *count += 1;
                    if *count >= self.config.repeat_limit {
                        break repeat_loop_response();
                    }

                    let Some(backend) = self.agents.get(&agent) else {
                        break format!("No agent is configured for '{agent}'.");
                    };

                    self.update_status(&format!("Running {agent}...")).await;
                    let outcome = backend.execute(&task).await;
                    debug!(%agent, success = outcome.success, "chain step finished");
                    steps.push(ChainStep {
                        agent,
                        task,
                        success: outcome.success,
                        message: outcome.message.clone(),
                        source: outcome.source.clone(),
                    });
                    self.memory
                        .lock()
                        .await
                        .push_assistant(&outcome.source, &outcome.message);

                    if !outcome.success {
                        break format!(
                            "Stopping chained execution because {agent} failed: {}",
                            outcome.message
                        );
                    }
                    successful_steps += 1;
                }
            }
        };

        self.finish(&response).await;
        SessionResult {
            response,
            chain_steps: steps,
        }
    }

    async fn build_request(
        &self,
        user_prompt: &str,
        steps: &[ChainStep],
        context: Option<&ScreenContext>,
    ) -> ModelRequest {
        let transcript = self.memory.lock().await.transcript();
        let chain_state = render_chain_state(steps, context);

        let mut body = String::new();
        if !transcript.is_empty() {
            body.push_str("Conversation so far:\n");
            body.push_str(&transcript);
            body.push_str("\n\n");
        }
        if !chain_state.is_empty() {
            body.push_str(&chain_state);
            body.push('\n');
        }
        body.push_str("Current request: ");
        body.push_str(user_prompt);

        ModelRequest {
            system_instruction: Some(router_system_prompt(self.personalization.as_deref())),
            parts: vec![clovis_model::RequestPart::Text(body)],
            tools: router_tool_decls(),
            config: Some(GenerationConfig {
                max_output_tokens: 1000,
                ..GenerationConfig::default()
            }),
        }
    }

    async fn finish(&self, response: &str) {
        info!(%response, "router session finished");
        self.memory.lock().await.push_assistant("rapid", response);
        self.send(OverlayCommand::CompleteStatusBubble {
            response_text: response.to_string(),
            done_text: "Task done".into(),
            delay_ms: 2000,
            source: "rapid".into(),
            theme: None,
        })
        .await;
    }
}

fn normalize_task(task: &str) -> String {
    task.trim().to_lowercase()
}

fn repeat_loop_response() -> String {
    "I noticed I kept repeating the same step, so I stopped. \
     Tell me if you want me to try a different approach."
        .to_string()
}

fn bound_error_text(text: &str) -> String {
    text.chars().take(ERROR_TEXT_MAX_CHARS).collect()
}

/// Replace "already completed / repeat" artifacts with a summary built from
/// the last successful chain steps, unless the user explicitly asked to
/// repeat.
fn sanitize_direct_response(text: &str, user_prompt: &str, steps: &[ChainStep]) -> String {
    let lowered = text.to_lowercase();
    let is_repeat_artifact = [
        "repeat the exact same task",
        "same task that was just completed",
        "already completed",
        "already been completed",
        "asking me to repeat",
    ]
    .iter()
    .any(|m| lowered.contains(m));
    if !is_repeat_artifact {
        return text.to_string();
    }

    let user_lowered = user_prompt.to_lowercase();
    let user_wants_repeat = ["again", "repeat", "once more", "redo", "one more time"]
        .iter()
        .any(|m| user_lowered.contains(m));
    if user_wants_repeat {
        return text.to_string();
    }

    let recent: Vec<&str> = steps
        .iter()
        .rev()
        .filter(|s| s.success)
        .take(2)
        .map(|s| s.message.as_str())
        .collect();
    if recent.is_empty() {
        return text.to_string();
    }
    let mut messages: Vec<&str> = recent;
    messages.reverse();
    format!("Task completed: {}", messages.join(" "))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
