// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! The per-task execution loop of the vision agent.
//!
//! One model call per step.  The model returns at most a position+click
//! pair plus a short status string; the engine normalizes the batch,
//! executes the calls, and watches for the two loop shapes that plague
//! vision agents: exact repeats of one action, and alternating
//! position↔click cycles that evade immediate-repeat checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use image::RgbImage;
use serde_json::Value;
use tracing::{debug, info, warn};

use clovis_model::{FunctionCall, GenerationConfig, ModelInvoker, ModelRequest, RequestPart, ToolDecl};
use clovis_overlay::{CommandSink, OverlayCommand};

use super::locator::{crop_and_search, legacy_find_and_click, png_bytes};
use super::tools::{
    filter_declared_args, is_click_tool, is_positioning_tool, vision_tool_decls, ClickKind,
    CLICK_LEFT, CROP_AND_SEARCH, GO_TO_ELEMENT, PRESS_ALT_HOTKEY, PRESS_CTRL_HOTKEY,
    REMEMBER_INFORMATION, TASK_IS_COMPLETE, TOOL_METADATA_KEYS, TTS_SPEAK, TYPE_STRING,
};
use super::{CaptureContext, InputDriver, ScreenCapture};
use crate::tts::TtsClient;

const MAX_MODEL_RETRIES: u32 = 3;
const MAX_FAILURES_BEFORE_FALLBACK: u32 = 3;
/// Pure positioning repeated this often auto-triggers the click itself.
const AUTO_CLICK_AFTER_REPEAT_POSITIONING_THRESHOLD: u32 = 2;
/// Coarse center buckets (0–1000 space) so small bbox jitter still counts
/// as repetition.
const POSITION_BUCKET_SIZE: f64 = 40.0;
/// An alternating (position, click) pair repeated this often ends the task.
const CLICK_CYCLE_LOOP_STOP_THRESHOLD: u32 = 4;
const ACTION_SETTLE_DELAY: Duration = Duration::from_secs(1);
const POST_BATCH_DELAY: Duration = Duration::from_millis(50);
const STATUS_HIDE_DELAY_MS: u64 = 400;
const TERMINAL_STATUS_HIDE_DELAY_MS: u64 = 700;

/// Small bbox thresholds that trigger crop-and-search refinement.
const SMALL_BBOX_SIDE_PX: f64 = 96.0;
const SMALL_BBOX_AREA_PX: f64 = 14_000.0;

/// How a vision run can end early.  Cancellation is a clean outcome that
/// the caller tears down silently; `Other` carries a real failure.
/// `DebugStop` is the opt-in diagnostic mode that halts after the first
/// positioning call, typed so the loop consumes it like any other outcome.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("stop requested by user")]
    Cancelled,
    #[error("debug stop after first positioning step; snapshot: {snapshot}")]
    DebugStop { snapshot: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Env flag that halts the loop after the first `go_to_element`, saving a
/// bbox overlay snapshot for inspection.
const DEBUG_STOP_ENV: &str = "CLOVIS_VISION_DEBUG_STOP_AFTER_FIRST_GOTO";

fn is_truthy_env(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim).map(str::to_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

const THINKING_MESSAGES: &[&str] = &[
    "Analyzing screen...",
    "Reviewing visible UI elements...",
    "Planning the next action...",
    "Checking the safest interaction...",
];

const VISION_SYSTEM_PROMPT: &str = "\
You are a next generation advanced AI assistant controlling a computer.
You can see the user's current active window and interact with it via mouse and keyboard.

You are tasked with controlling a computer step by step in order to achieve a certain goal.
You will be given a screenshot of the current application window, and based on what you see,
you will call functions to get you closer to your goal.

IMPORTANT RULES:
- Execute functions on a page-by-page basis
- You may call ONE function, or a TWO-function position+click sequence
- If you call TWO functions, they must be:
  1) `go_to_element` or `crop_and_search`
  2) then one click tool (`click_left_click` / `click_double_left_click` / `click_right_click`)
- Never call more than TWO functions in one response
- After your response is executed, the screen will be re-captured and you'll be called again
- Do NOT attempt to do things you don't yet see on screen
- For every non-terminal action, include a concise status_text argument for UI feedback
- For click actions, include target_description so fallback localization can be used if needed
- Clicks are a two-step flow: first position the cursor, then call a click function
- Click tools use the current cursor location (no x/y params)
- Do not call `go_to_element` or `crop_and_search` repeatedly for the same target on an unchanged screen
- `crop_and_search` is OPTIONAL: use it when the target is small/crowded or confidence is low
- For `crop_and_search`, provide a bounding box [ymin, xmin, ymax, xmax] (0-1000 coords); it is padded internally
- Before choosing an action, check if the user goal is already satisfied on screen
- When the task is complete, call `task_is_complete` immediately and nothing else
- App-launch tasks should prefer the keyboard flow: press_ctrl_hotkey(key=\"space\"), then type_string(string=\"<app name>\", submit=true)
- Do not stop after an app opens if the user asked for more actions";

// ─── Signatures ───────────────────────────────────────────────────────────────

/// Identity of one action for repeat detection.  Positioning tools collapse
/// to a coarse center bucket; everything else keys on its filtered args.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SigKey {
    Bucket(i64, i64),
    Args(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Signature {
    pub tool: String,
    pub key: SigKey,
}

fn to_norm_0_1000(value: f64) -> f64 {
    if (0.0..=1.0).contains(&value) {
        value * 1000.0
    } else {
        // Per-mille values pass through; pixel values still bucket usefully.
        value
    }
}

fn position_bucket(args: &Value) -> Option<(i64, i64)> {
    let get = |key: &str| args.get(key).and_then(Value::as_f64).map(to_norm_0_1000);
    let (ymin, xmin, ymax, xmax) = (get("ymin")?, get("xmin")?, get("ymax")?, get("xmax")?);
    let center_x = (xmin + xmax) / 2.0;
    let center_y = (ymin + ymax) / 2.0;
    Some((
        (center_x / POSITION_BUCKET_SIZE).floor() as i64,
        (center_y / POSITION_BUCKET_SIZE).floor() as i64,
    ))
}

fn canonical_args(args: &Value) -> String {
    let mut pairs: Vec<(String, String)> = args
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
        .unwrap_or_default();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct VisionEngine {
    model: Arc<dyn ModelInvoker>,
    locator_model: Arc<dyn ModelInvoker>,
    capture: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputDriver>,
    sink: Option<Arc<dyn CommandSink>>,
    tts: Option<Arc<TtsClient>>,
    stop: Arc<AtomicBool>,
    decls: Vec<ToolDecl>,

    // Per-task loop state.
    last_capture: Option<(RgbImage, CaptureContext)>,
    memory: Vec<String>,
    retries: u32,
    consecutive_failures: u32,
    last_action_signature: Option<Signature>,
    repeated_action_count: u32,
    last_click_context: Option<(ClickKind, String)>,
    last_target_description: Option<String>,
    pending_position_signature: Option<Signature>,
    last_click_cycle_signature: Option<(Signature, Signature)>,
    repeated_click_cycle_count: u32,
    status_visible: bool,
    last_status_text: Option<String>,
    thinking_index: usize,
    debug_stop_after_first_goto: bool,
    debug_snapshot_taken: bool,
}

impl VisionEngine {
    pub fn new(
        model: Arc<dyn ModelInvoker>,
        locator_model: Arc<dyn ModelInvoker>,
        capture: Arc<dyn ScreenCapture>,
        input: Arc<dyn InputDriver>,
        sink: Option<Arc<dyn CommandSink>>,
        tts: Option<Arc<TtsClient>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            model,
            locator_model,
            capture,
            input,
            sink,
            tts,
            stop,
            decls: vision_tool_decls(),
            last_capture: None,
            memory: Vec::new(),
            retries: 0,
            consecutive_failures: 0,
            last_action_signature: None,
            repeated_action_count: 0,
            last_click_context: None,
            last_target_description: None,
            pending_position_signature: None,
            last_click_cycle_signature: None,
            repeated_click_cycle_count: 0,
            status_visible: false,
            last_status_text: None,
            thinking_index: 0,
            debug_stop_after_first_goto: is_truthy_env(std::env::var(DEBUG_STOP_ENV).ok()),
            debug_snapshot_taken: false,
        }
    }

    /// Run the task until completion or unrecoverable failure.
    pub async fn run(&mut self, task: &str) -> Result<(), VisionError> {
        let result = self.run_inner(task).await;
        self.hide_statuses(STATUS_HIDE_DELAY_MS).await;
        result
    }

    async fn run_inner(&mut self, task: &str) -> Result<(), VisionError> {
        self.check_stop()?;
        loop {
            self.check_stop()?;
            let response = self.generate_step(task).await?;
            self.check_stop()?;

            let calls = response.function_calls;
            if calls.is_empty() {
                if self.handle_no_function_call(task).await? {
                    continue;
                }
                return Ok(());
            }

            let calls = normalize_batch(calls);
            if calls.len() > 1 {
                debug!(count = calls.len(), "executing multi-call batch");
            }
            if self.handle_calls(task, calls).await? {
                return Ok(());
            }

            self.check_stop()?;
            tokio::time::sleep(POST_BATCH_DELAY).await;
        }
    }

    fn check_stop(&self) -> Result<(), VisionError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(VisionError::Cancelled);
        }
        Ok(())
    }

    async fn generate_step(
        &mut self,
        task: &str,
    ) -> Result<clovis_model::ModelResponse, VisionError> {
        loop {
            self.check_stop()?;
            let (screenshot, ctx) = self
                .capture
                .capture_active_window()
                .context("capturing active window")?;
            let window_title = self.capture.active_window_title();
            let prompt = self.build_step_prompt(task, &window_title);

            let thinking = THINKING_MESSAGES[self.thinking_index % THINKING_MESSAGES.len()];
            self.thinking_index += 1;
            self.set_status(thinking).await;

            let mut request = ModelRequest::from_text(prompt)
                .with_tools(self.decls.clone())
                .with_config(GenerationConfig::default());
            request.parts.push(RequestPart::png(&png_bytes(&screenshot)?));
            self.last_capture = Some((screenshot, ctx));

            self.check_stop()?;
            match self.model.generate(request).await {
                Ok(response) => {
                    self.retries = 0;
                    return Ok(response);
                }
                Err(e) => {
                    self.retries += 1;
                    if self.retries >= MAX_MODEL_RETRIES {
                        return Err(e.context("vision model call failed").into());
                    }
                    self.set_status(&format!(
                        "Model error. Retrying ({}/{MAX_MODEL_RETRIES})...",
                        self.retries
                    ))
                    .await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn build_step_prompt(&self, task: &str, window_title: &str) -> String {
        let memory = serde_json::to_string(&self.memory).unwrap_or_else(|_| "[]".into());
        format!(
            "{VISION_SYSTEM_PROMPT}\n\n\
             You are controlling the user's active application window.\n\
             Application: {window_title}\n\
             User goal: {task}\n\
             Stored memory: {memory}\n\n\
             First, analyze the screenshot in detail privately.\n\
             Then decide the best NEXT action for this exact screen."
        )
    }

    async fn handle_no_function_call(&mut self, task: &str) -> Result<bool, VisionError> {
        self.check_stop()?;
        self.consecutive_failures += 1;
        self.retries += 1;

        if self.consecutive_failures >= MAX_FAILURES_BEFORE_FALLBACK
            && self.attempt_fallback(task, None, None).await
        {
            self.retries = 0;
            self.consecutive_failures = 0;
            return Ok(true);
        }

        if self.retries < MAX_MODEL_RETRIES {
            self.set_status(&format!(
                "No action selected. Retrying ({}/{MAX_MODEL_RETRIES})...",
                self.retries
            ))
            .await;
            return Ok(true);
        }

        self.speak("I couldn't determine the next action. Please try again.")
            .await;
        Err(anyhow::anyhow!("max retries reached without a function call").into())
    }

    async fn handle_calls(
        &mut self,
        task: &str,
        calls: Vec<FunctionCall>,
    ) -> Result<bool, VisionError> {
        let has_explicit_click = calls.iter().any(|c| is_click_tool(&c.name));
        for call in calls {
            let done = self
                .handle_call(task, call, !has_explicit_click)
                .await?;
            if done {
                return Ok(true);
            }
            self.check_stop()?;
        }
        Ok(false)
    }

    async fn handle_call(
        &mut self,
        task: &str,
        call: FunctionCall,
        allow_positioning_autoclick: bool,
    ) -> Result<bool, VisionError> {
        self.check_stop()?;
        let name = call.name.clone();

        let status_text = call
            .str_arg("status_text")
            .map(String::from)
            .unwrap_or_else(|| default_status_text(&name).to_string());
        self.set_status(&status_text).await;

        let click_type = ClickKind::from_tool(&name);
        let signature = self.action_signature(&call);
        if Some(&signature) == self.last_action_signature.as_ref() {
            self.repeated_action_count += 1;
        } else {
            self.last_action_signature = Some(signature.clone());
            self.repeated_action_count = 1;
        }

        if let Some(kind) = click_type {
            if self.repeated_action_count >= MAX_FAILURES_BEFORE_FALLBACK
                && self.attempt_fallback(task, Some(kind), Some(&call)).await
            {
                self.consecutive_failures = 0;
                self.repeated_action_count = 0;
                return Ok(false);
            }
        }

        // A positioning call repeated without any click: the model is stuck
        // re-aiming.  Execute the click it keeps avoiding.
        if allow_positioning_autoclick
            && is_positioning_tool(&name)
            && self.repeated_action_count >= AUTO_CLICK_AFTER_REPEAT_POSITIONING_THRESHOLD
        {
            let kind = ClickKind::infer_from_text(&format!(
                "{} {} {task}",
                call.str_arg("status_text").unwrap_or_default(),
                call.str_arg("target_description").unwrap_or_default(),
            ));
            let target = self.resolve_target_description(task, &call);
            self.set_status(&format!(
                "Position repeated. Executing {} on {target}...",
                kind.label()
            ))
            .await;
            self.input.click(kind)?;
            info!(%target, click = kind.label(), "auto-click after repeated positioning");
            self.last_target_description = Some(target.clone());
            self.last_click_context = Some((kind, target));
            self.last_action_signature = None;
            self.repeated_action_count = 0;
            self.consecutive_failures = 0;
            self.settle().await?;
            return Ok(false);
        }

        debug!(tool = %name, args = %call.args, "executing vision tool");

        match self.execute_call(task, &call).await {
            Ok(()) => {
                self.consecutive_failures = 0;

                if is_positioning_tool(&name) {
                    self.last_target_description =
                        Some(self.resolve_target_description(task, &call));
                }
                if name == GO_TO_ELEMENT {
                    self.maybe_debug_stop(&call).await?;
                }
                if let Some(kind) = click_type {
                    let target = self.resolve_target_description(task, &call);
                    self.last_target_description = Some(target.clone());
                    self.last_click_context = Some((kind, target));
                }

                if matches!(name.as_str(), TTS_SPEAK | TASK_IS_COMPLETE) {
                    self.set_status("Task complete").await;
                    self.hide_statuses(TERMINAL_STATUS_HIDE_DELAY_MS).await;
                    return Ok(true);
                }

                if self.register_action_and_detect_click_loop(task, &name, &signature, click_type)
                {
                    let target = self.resolve_target_description(task, &call);
                    self.set_status("Task appears complete. Stopping repeated clicks.")
                        .await;
                    info!(%target, "alternating position+click loop detected, stopping");
                    self.hide_statuses(TERMINAL_STATUS_HIDE_DELAY_MS).await;
                    return Ok(true);
                }

                self.settle().await?;
                Ok(false)
            }
            Err(e) => {
                warn!(tool = %name, "tool execution failed: {e:#}");
                self.consecutive_failures += 1;

                if let Some(kind) = click_type {
                    if self.consecutive_failures >= MAX_FAILURES_BEFORE_FALLBACK
                        && self.attempt_fallback(task, Some(kind), Some(&call)).await
                    {
                        self.consecutive_failures = 0;
                        self.repeated_action_count = 0;
                        return Ok(false);
                    }
                }

                if self.retries < MAX_MODEL_RETRIES {
                    self.retries += 1;
                    self.set_status(&format!(
                        "Action failed. Retrying ({}/{MAX_MODEL_RETRIES})...",
                        self.retries
                    ))
                    .await;
                    return Ok(false);
                }
                Err(e.into())
            }
        }
    }

    async fn execute_call(&mut self, task: &str, call: &FunctionCall) -> anyhow::Result<()> {
        let args = filter_declared_args(call, &self.decls);
        match call.name.as_str() {
            GO_TO_ELEMENT => {
                let bounds = bbox_from_args(&args)?;
                let (screenshot, ctx) = self
                    .last_capture
                    .as_ref()
                    .context("no capture available for positioning")?;

                if is_small_bbox(bounds, ctx) {
                    // Tiny target: refine through the secondary locator
                    // before positioning.
                    let target = self.resolve_target_description(task, call);
                    let located =
                        crop_and_search(screenshot, ctx, bounds, &target, &*self.locator_model)
                            .await?;
                    self.input.move_cursor(located.x, located.y)?;
                } else {
                    let (x, y) = bbox_center_on_screen(bounds, ctx);
                    self.input.move_cursor(x, y)?;
                }
                Ok(())
            }
            CROP_AND_SEARCH => {
                let bounds = bbox_from_args(&args)?;
                let target = self.resolve_target_description(task, call);
                let (screenshot, ctx) = self
                    .last_capture
                    .as_ref()
                    .context("no capture available for crop-and-search")?;
                let located =
                    crop_and_search(screenshot, ctx, bounds, &target, &*self.locator_model).await?;
                self.input.move_cursor(located.x, located.y)?;
                Ok(())
            }
            name if is_click_tool(name) => {
                let kind = ClickKind::from_tool(name).expect("classified as click tool");
                self.input.click(kind)
            }
            TYPE_STRING => {
                let text = args
                    .get("string")
                    .and_then(Value::as_str)
                    .context("type_string requires 'string'")?;
                let submit = args.get("submit").and_then(Value::as_bool).unwrap_or(false);
                self.input.type_string(text, submit)
            }
            PRESS_CTRL_HOTKEY => {
                let key = args
                    .get("key")
                    .and_then(Value::as_str)
                    .context("press_ctrl_hotkey requires 'key'")?;
                self.input.press_ctrl_hotkey(key)
            }
            PRESS_ALT_HOTKEY => {
                let key = args
                    .get("key")
                    .and_then(Value::as_str)
                    .context("press_alt_hotkey requires 'key'")?;
                self.input.press_alt_hotkey(key)
            }
            REMEMBER_INFORMATION => {
                if let Some(info) = args.get("information").and_then(Value::as_str) {
                    self.memory.push(info.to_string());
                }
                Ok(())
            }
            TASK_IS_COMPLETE => Ok(()),
            TTS_SPEAK => {
                let text = call.str_arg("text").unwrap_or("Task complete.").to_string();
                self.speak(&text).await;
                Ok(())
            }
            other => anyhow::bail!("unknown vision tool: {other}"),
        }
    }

    /// Same `(tool, filtered args)` identity the repeat detector keys on.
    /// Positioning tools collapse to their center bucket so label jitter
    /// does not defeat detection; clicks inherit the last target label.
    fn action_signature(&self, call: &FunctionCall) -> Signature {
        let mut filtered = serde_json::Map::new();
        if let Some(args) = call.args.as_object() {
            for (key, value) in args {
                if !TOOL_METADATA_KEYS.contains(&key.as_str()) {
                    filtered.insert(key.clone(), value.clone());
                }
            }
        }
        if is_click_tool(&call.name) {
            if let Some(target) = &self.last_target_description {
                filtered.insert("target_description".into(), Value::String(target.clone()));
            }
        }
        let filtered = Value::Object(filtered);

        if is_positioning_tool(&call.name) {
            if let Some((bx, by)) = position_bucket(&filtered) {
                return Signature {
                    tool: call.name.clone(),
                    key: SigKey::Bucket(bx, by),
                };
            }
        }
        Signature {
            tool: call.name.clone(),
            key: SigKey::Args(canonical_args(&filtered)),
        }
    }

    /// Detect alternating position+click loops (A,B,A,B…).  Returns `true`
    /// when the task should stop.
    fn register_action_and_detect_click_loop(
        &mut self,
        task: &str,
        name: &str,
        signature: &Signature,
        click_type: Option<ClickKind>,
    ) -> bool {
        if is_positioning_tool(name) {
            self.pending_position_signature = Some(signature.clone());
            return false;
        }

        if click_type.is_some() {
            let Some(position) = self.pending_position_signature.clone() else {
                return false;
            };
            let cycle = (position, signature.clone());
            if Some(&cycle) == self.last_click_cycle_signature.as_ref() {
                self.repeated_click_cycle_count += 1;
            } else {
                self.last_click_cycle_signature = Some(cycle);
                self.repeated_click_cycle_count = 1;
            }
            return self.repeated_click_cycle_count >= CLICK_CYCLE_LOOP_STOP_THRESHOLD
                && !task_expects_repeated_clicks(task);
        }

        // Other actions reset this specific loop detector.
        self.pending_position_signature = None;
        self.last_click_cycle_signature = None;
        self.repeated_click_cycle_count = 0;
        false
    }

    /// Opt-in diagnostic: after the first `go_to_element` with a full bbox,
    /// save an overlay snapshot and end the run with the typed debug-stop
    /// outcome.
    async fn maybe_debug_stop(&mut self, call: &FunctionCall) -> Result<(), VisionError> {
        if !self.debug_stop_after_first_goto || self.debug_snapshot_taken {
            return Ok(());
        }
        if bbox_from_args(&call.args).is_err() {
            return Ok(());
        }
        let snapshot = match self.save_goto_debug_snapshot(call) {
            Ok(path) => path,
            Err(e) => format!("<failed to save snapshot: {e}>"),
        };
        self.debug_snapshot_taken = true;
        self.set_status("Debug snapshot saved. Stopping after first positioning step.")
            .await;
        Err(VisionError::DebugStop { snapshot })
    }

    /// Render the positioning bbox onto the step's capture and write it to
    /// the temp dir.
    fn save_goto_debug_snapshot(&self, call: &FunctionCall) -> anyhow::Result<String> {
        let (screenshot, _ctx) = self
            .last_capture
            .as_ref()
            .context("no capture available for snapshot")?;
        let bounds = bbox_from_args(&call.args)?;
        let mut annotated = screenshot.clone();
        let (w, h) = annotated.dimensions();
        let clamp_px = |v: f64, max: u32| (v.max(0.0) as u32).min(max.saturating_sub(1));
        let top = clamp_px(clovis_overlay::normalize_to_pixels(bounds.0, h as f64), h);
        let left = clamp_px(clovis_overlay::normalize_to_pixels(bounds.1, w as f64), w);
        let bottom = clamp_px(clovis_overlay::normalize_to_pixels(bounds.2, h as f64), h);
        let right = clamp_px(clovis_overlay::normalize_to_pixels(bounds.3, w as f64), w);

        let stroke = image::Rgb([255u8, 60, 60]);
        for x in left..=right {
            annotated.put_pixel(x, top, stroke);
            annotated.put_pixel(x, bottom, stroke);
        }
        for y in top..=bottom {
            annotated.put_pixel(left, y, stroke);
            annotated.put_pixel(right, y, stroke);
        }

        let path = std::env::temp_dir().join(format!(
            "clovis_goto_debug_{}.png",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));
        annotated
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path.display().to_string())
    }

    /// Legacy two-call locator fallback.  Uses the failing call's context
    /// when available, the last successful click context otherwise.
    async fn attempt_fallback(
        &mut self,
        task: &str,
        click_type: Option<ClickKind>,
        call: Option<&FunctionCall>,
    ) -> bool {
        if self.check_stop().is_err() {
            return false;
        }

        let context = match (click_type, call) {
            (Some(kind), Some(call)) => {
                Some((kind, self.resolve_target_description(task, call)))
            }
            _ => self.last_click_context.clone(),
        };
        let Some((kind, target)) = context else {
            return false;
        };
        if target.is_empty() {
            return false;
        }

        self.set_status(&format!("{target} is uncertain. Using precision fallback..."))
            .await;
        match legacy_find_and_click(kind, &target, &*self.capture, &*self.locator_model, &*self.input)
            .await
        {
            Ok(()) => {
                self.set_status(&format!("Fallback located {target}.")).await;
                true
            }
            Err(e) => {
                warn!("legacy locator fallback failed: {e:#}");
                false
            }
        }
    }

    fn resolve_target_description(&self, task: &str, call: &FunctionCall) -> String {
        if let Some(target) = call.str_arg("target_description") {
            return target.to_string();
        }
        if let Some(status) = call.str_arg("status_text") {
            let normalized = status.trim().trim_end_matches('.');
            let lower = normalized.to_lowercase();
            for prefix in [
                "searching for ",
                "looking for ",
                "locating ",
                "clicking ",
                "opening ",
                "selecting ",
            ] {
                if lower.starts_with(prefix) {
                    let candidate = normalized[prefix.len()..].trim();
                    if !candidate.is_empty() {
                        return candidate.to_string();
                    }
                }
            }
            return normalized.to_string();
        }
        if let Some(last) = &self.last_target_description {
            if !last.trim().is_empty() {
                return last.trim().to_string();
            }
        }
        format!("best target for task: {task}")
    }

    // ── Status surface ────────────────────────────────────────────────────────

    async fn set_status(&mut self, text: &str) {
        if Some(text) == self.last_status_text.as_deref() {
            return;
        }
        let source = "cua_vision".to_string();
        if let Some(sink) = &self.sink {
            if !self.status_visible {
                sink.send(OverlayCommand::ShowStatusBubble {
                    text: text.into(),
                    source: source.clone(),
                    theme: None,
                })
                .await;
                sink.send(OverlayCommand::ShowCursorStatus {
                    text: text.into(),
                    source,
                    theme: None,
                })
                .await;
            } else {
                sink.send(OverlayCommand::UpdateStatusBubble {
                    text: text.into(),
                    source: source.clone(),
                    theme: None,
                })
                .await;
                sink.send(OverlayCommand::UpdateCursorStatus {
                    text: text.into(),
                    source,
                    theme: None,
                })
                .await;
            }
        }
        self.status_visible = true;
        self.last_status_text = Some(text.to_string());
    }

    async fn hide_statuses(&mut self, delay_ms: u64) {
        if !self.status_visible {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.send(OverlayCommand::HideCursorStatus).await;
            sink.send(OverlayCommand::HideStatusBubble { delay: delay_ms }).await;
        }
        self.status_visible = false;
        self.last_status_text = None;
    }

    async fn speak(&self, text: &str) {
        if let Some(tts) = &self.tts {
            tts.speak(text).await;
        } else {
            info!(%text, "tts not configured, skipping speech");
        }
    }

    async fn settle(&self) -> Result<(), VisionError> {
        self.check_stop()?;
        tokio::time::sleep(ACTION_SETTLE_DELAY).await;
        Ok(())
    }
}

// ─── Batch normalization ──────────────────────────────────────────────────────

/// Allow one call, a position+click pair, or position+click+complete.
/// Extras are dropped; two consecutive clicks never survive as a batch.
pub(crate) fn normalize_batch(calls: Vec<FunctionCall>) -> Vec<FunctionCall> {
    if calls.len() <= 1 {
        return calls;
    }
    if calls[0].name == TASK_IS_COMPLETE {
        return calls.into_iter().take(1).collect();
    }

    let first_positioning = is_positioning_tool(&calls[0].name);
    let first_click = is_click_tool(&calls[0].name);
    let second_click = is_click_tool(&calls[1].name);
    let second_complete = calls[1].name == TASK_IS_COMPLETE;

    if first_positioning && second_click {
        if calls.len() >= 3 && calls[2].name == TASK_IS_COMPLETE {
            if calls.len() > 3 {
                debug!("dropping extras after position+click+complete");
            }
            return calls.into_iter().take(3).collect();
        }
        if calls.len() > 2 {
            debug!("dropping extras after position+click");
        }
        return calls.into_iter().take(2).collect();
    }

    if first_click && second_complete {
        if calls.len() > 2 {
            debug!("dropping extras after click+complete");
        }
        return calls.into_iter().take(2).collect();
    }

    debug!("unsupported multi-call sequence, executing only the first call");
    calls.into_iter().take(1).collect()
}

pub(crate) fn task_expects_repeated_clicks(task: &str) -> bool {
    let lowered = task.to_lowercase();
    [
        "times",
        "repeatedly",
        "keep clicking",
        "click again",
        "double click multiple",
        "spam click",
        "until",
        "every",
        "loop",
    ]
    .iter()
    .any(|m| lowered.contains(m))
}

fn default_status_text(tool_name: &str) -> &'static str {
    match tool_name {
        TYPE_STRING => "Typing...",
        PRESS_CTRL_HOTKEY | PRESS_ALT_HOTKEY => "Using shortcut...",
        GO_TO_ELEMENT => "Positioning cursor to target...",
        CLICK_LEFT | super::tools::CLICK_DOUBLE | super::tools::CLICK_RIGHT => "Clicking target...",
        CROP_AND_SEARCH => "Zooming in for a precision click...",
        TTS_SPEAK => "Preparing response...",
        TASK_IS_COMPLETE => "Task complete",
        _ => "Working...",
    }
}

// ─── Geometry ─────────────────────────────────────────────────────────────────

fn bbox_from_args(args: &Value) -> anyhow::Result<(f64, f64, f64, f64)> {
    let get = |key: &str| {
        args.get(key)
            .and_then(Value::as_f64)
            .with_context(|| format!("bbox argument '{key}' missing"))
    };
    Ok((get("ymin")?, get("xmin")?, get("ymax")?, get("xmax")?))
}

fn bbox_logical_size(bounds: (f64, f64, f64, f64), ctx: &CaptureContext) -> (f64, f64) {
    let (lw, lh) = ctx.logical_size;
    let top = clovis_overlay::normalize_to_pixels(bounds.0, lh);
    let left = clovis_overlay::normalize_to_pixels(bounds.1, lw);
    let bottom = clovis_overlay::normalize_to_pixels(bounds.2, lh);
    let right = clovis_overlay::normalize_to_pixels(bounds.3, lw);
    ((right - left).abs(), (bottom - top).abs())
}

fn is_small_bbox(bounds: (f64, f64, f64, f64), ctx: &CaptureContext) -> bool {
    let (w, h) = bbox_logical_size(bounds, ctx);
    w <= SMALL_BBOX_SIDE_PX || h <= SMALL_BBOX_SIDE_PX || w * h <= SMALL_BBOX_AREA_PX
}

fn bbox_center_on_screen(bounds: (f64, f64, f64, f64), ctx: &CaptureContext) -> (f64, f64) {
    let (iw, ih) = (ctx.image_size.0 as f64, ctx.image_size.1 as f64);
    let top = clovis_overlay::normalize_to_pixels(bounds.0, ih);
    let left = clovis_overlay::normalize_to_pixels(bounds.1, iw);
    let bottom = clovis_overlay::normalize_to_pixels(bounds.2, ih);
    let right = clovis_overlay::normalize_to_pixels(bounds.3, iw);
    ctx.image_to_screen(left + (right - left) / 2.0, top + (bottom - top) / 2.0)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
