// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! GUI vision agent.
//!
//! Per step: capture the active window, ask the vision model for at most a
//! position+click pair of function calls, execute them through the input
//! driver, repeat until `task_is_complete`.  The engine owns the loop
//! guards that keep a confused model from clicking forever.
//!
//! OS primitives stay behind two narrow traits: [`ScreenCapture`] and
//! [`InputDriver`].  Production wiring uses the overlay screenshot cache
//! for capture and an enigo-backed input driver; tests use recording fakes.

mod engine;
mod locator;
mod tools;

pub use engine::{VisionEngine, VisionError};
pub use tools::{vision_tool_decls, ClickKind};
pub(crate) use locator::png_bytes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use tracing::warn;

use clovis_model::ModelInvoker;
use clovis_overlay::CommandSink;

use crate::tts::TtsClient;
use crate::{Agent, StepOutcome};

/// Geometry of one capture: how image pixels map back to screen points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureContext {
    /// Logical size of the captured surface (points).
    pub logical_size: (f64, f64),
    /// Pixel size of the captured image.
    pub image_size: (u32, u32),
    /// Screen-space offset of the capture's top-left corner.
    pub offset: (f64, f64),
    /// Image-pixel to logical-point scale per axis.
    pub scale: (f64, f64),
}

impl CaptureContext {
    /// Full-screen capture with identity scale.
    pub fn full_screen(width: u32, height: u32) -> Self {
        Self {
            logical_size: (width as f64, height as f64),
            image_size: (width, height),
            offset: (0.0, 0.0),
            scale: (1.0, 1.0),
        }
    }

    /// Translate a point in image pixels to absolute screen coordinates.
    pub fn image_to_screen(&self, x: f64, y: f64) -> (f64, f64) {
        let sx = if self.scale.0 > 0.0 { self.scale.0 } else { 1.0 };
        let sy = if self.scale.1 > 0.0 { self.scale.1 } else { 1.0 };
        (x / sx + self.offset.0, y / sy + self.offset.1)
    }
}

/// Screen capture boundary.
pub trait ScreenCapture: Send + Sync {
    /// Capture the active window (or full screen) with its geometry.
    fn capture_active_window(&self) -> anyhow::Result<(RgbImage, CaptureContext)>;
    fn active_window_title(&self) -> String;
}

/// Mouse/keyboard boundary.  All coordinates are absolute screen points.
pub trait InputDriver: Send + Sync {
    fn move_cursor(&self, x: f64, y: f64) -> anyhow::Result<()>;
    fn click(&self, kind: ClickKind) -> anyhow::Result<()>;
    fn type_string(&self, text: &str, submit: bool) -> anyhow::Result<()>;
    /// Primary-modifier hotkey (Command on macOS, Ctrl elsewhere).
    fn press_ctrl_hotkey(&self, key: &str) -> anyhow::Result<()>;
    fn press_alt_hotkey(&self, key: &str) -> anyhow::Result<()>;
}

/// enigo-backed production input driver.
pub struct EnigoInput {
    inner: std::sync::Mutex<enigo::Enigo>,
}

impl EnigoInput {
    pub fn new() -> anyhow::Result<Self> {
        let enigo = enigo::Enigo::new(&enigo::Settings::default())
            .map_err(|e| anyhow::anyhow!("input driver unavailable: {e}"))?;
        Ok(Self {
            inner: std::sync::Mutex::new(enigo),
        })
    }

    fn with<R>(
        &self,
        f: impl FnOnce(&mut enigo::Enigo) -> Result<R, enigo::InputError>,
    ) -> anyhow::Result<R> {
        let mut guard = self.inner.lock().expect("input driver poisoned");
        f(&mut guard).map_err(|e| anyhow::anyhow!("input action failed: {e}"))
    }
}

impl InputDriver for EnigoInput {
    fn move_cursor(&self, x: f64, y: f64) -> anyhow::Result<()> {
        use enigo::Mouse;
        self.with(|e| e.move_mouse(x as i32, y as i32, enigo::Coordinate::Abs))
    }

    fn click(&self, kind: ClickKind) -> anyhow::Result<()> {
        use enigo::{Button, Direction, Mouse};
        self.with(|e| match kind {
            ClickKind::Left => e.button(Button::Left, Direction::Click),
            ClickKind::DoubleLeft => {
                e.button(Button::Left, Direction::Click)?;
                e.button(Button::Left, Direction::Click)
            }
            ClickKind::Right => e.button(Button::Right, Direction::Click),
        })
    }

    fn type_string(&self, text: &str, submit: bool) -> anyhow::Result<()> {
        use enigo::{Direction, Key, Keyboard};
        self.with(|e| {
            e.text(text)?;
            if submit {
                e.key(Key::Return, Direction::Click)?;
            }
            Ok(())
        })
    }

    fn press_ctrl_hotkey(&self, key: &str) -> anyhow::Result<()> {
        use enigo::{Direction, Key, Keyboard};
        let target = parse_key(key);
        self.with(|e| {
            #[cfg(target_os = "macos")]
            let modifier = Key::Meta;
            #[cfg(not(target_os = "macos"))]
            let modifier = Key::Control;
            e.key(modifier, Direction::Press)?;
            e.key(target, Direction::Click)?;
            e.key(modifier, Direction::Release)
        })
    }

    fn press_alt_hotkey(&self, key: &str) -> anyhow::Result<()> {
        use enigo::{Direction, Key, Keyboard};
        let target = parse_key(key);
        self.with(|e| {
            e.key(Key::Alt, Direction::Press)?;
            e.key(target, Direction::Click)?;
            e.key(Key::Alt, Direction::Release)
        })
    }
}

fn parse_key(key: &str) -> enigo::Key {
    use enigo::Key;
    match key.to_lowercase().as_str() {
        "space" => Key::Space,
        "tab" => Key::Tab,
        "enter" | "return" => Key::Return,
        "escape" | "esc" => Key::Escape,
        other => Key::Unicode(other.chars().next().unwrap_or(' ')),
    }
}

/// Desktop control agent: wraps a fresh [`VisionEngine`] run per task.
pub struct VisionAgent {
    model: Arc<dyn ModelInvoker>,
    locator_model: Arc<dyn ModelInvoker>,
    capture: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputDriver>,
    sink: Option<Arc<dyn CommandSink>>,
    tts: Option<Arc<TtsClient>>,
    stop: Arc<AtomicBool>,
}

impl VisionAgent {
    pub fn new(
        model: Arc<dyn ModelInvoker>,
        locator_model: Arc<dyn ModelInvoker>,
        capture: Arc<dyn ScreenCapture>,
        input: Arc<dyn InputDriver>,
    ) -> Self {
        Self {
            model,
            locator_model,
            capture,
            input,
            sink: None,
            tts: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn CommandSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_tts(mut self, tts: Arc<TtsClient>) -> Self {
        self.tts = Some(tts);
        self
    }

    /// Shared stop flag: setting it makes the engine raise a clean
    /// cancellation at its next check point.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Agent for VisionAgent {
    fn source(&self) -> &'static str {
        "cua_vision"
    }

    async fn execute(&self, task: &str) -> StepOutcome {
        // Each task starts with a cleared stop flag and fresh loop state.
        self.stop.store(false, Ordering::SeqCst);
        let mut engine = VisionEngine::new(
            Arc::clone(&self.model),
            Arc::clone(&self.locator_model),
            Arc::clone(&self.capture),
            Arc::clone(&self.input),
            self.sink.clone(),
            self.tts.clone(),
            Arc::clone(&self.stop),
        );
        match engine.run(task).await {
            Ok(()) => StepOutcome::ok(self.source(), "Task completed"),
            // A session-level stop already tears everything down; the
            // outcome only matters if the router was not aborted in time.
            Err(VisionError::Cancelled) => {
                StepOutcome::failed(self.source(), "Task cancelled")
            }
            Err(e) => {
                warn!("vision task failed: {e:#}");
                StepOutcome::failed(self.source(), e.to_string())
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
