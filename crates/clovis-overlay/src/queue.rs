// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Time-ordered draw action queue.
//!
//! Annotation tools enqueue deferred overlay operations with per-batch time
//! offsets; a single consumer executes them serially, spacing actions by
//! offset deltas against an explicit cursor rather than the wall clock.
//! Text actions go through the non-overlap layout before shipping a
//! `draw_text` frame.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::commands::{CommandSink, OverlayCommand};
use crate::layout::{
    estimate_panel_size, normalize_to_pixels, resolve_anchor_rect, Align, Baseline, LayoutCache,
    Rect, TextAnchor,
};

/// Direct responses stay on screen at least this long before the consumer
/// may hide them to make room for the next action.
const DIRECT_RESPONSE_MIN_DISPLAY: Duration = Duration::from_secs(4);

const DEFAULT_FONT_FAMILY: &str = "system-ui";
const DEFAULT_FONT_SIZE: u32 = 16;

/// A deferred overlay operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawAction {
    /// Bounding box in (y_min, x_min, y_max, x_max) order; coordinates may
    /// be ratios, 0–1000 normalized, or absolute pixels.
    BoundingBox {
        y_min: f64,
        x_min: f64,
        y_max: f64,
        x_max: f64,
        id: Option<String>,
        stroke: Option<String>,
        stroke_width: u32,
        opacity: f64,
        auto_contrast: bool,
        fill: Option<String>,
    },
    Text {
        x: f64,
        y: f64,
        text: String,
        id: Option<String>,
        font_size: u32,
        align: String,
        baseline: String,
        source: Option<String>,
    },
    Dot {
        x: f64,
        y: f64,
        radius: f64,
        color: Option<String>,
        id: Option<String>,
    },
    RemoveBox { id: String },
    RemoveText { id: String },
    RemoveDot { id: String },
    Clear,
    /// Terminal text answer shown centered; kept visible ≥ 4 s.
    DirectResponse { text: String, source: Option<String> },
}

struct QueueInner {
    sink: Arc<dyn CommandSink>,
    queue: Mutex<VecDeque<(f64, DrawAction)>>,
    notify: Notify,
    cache: Mutex<LayoutCache>,
    viewport: Mutex<(f64, f64)>,
    /// Last executed time offset within the current batch.
    last_offset: Mutex<f64>,
    /// Direct response currently displayed: (shown at, text id).
    pending_direct: Mutex<Option<(Instant, String)>>,
}

/// Single-consumer executor for [`DrawAction`]s.
pub struct DrawQueue {
    inner: Arc<QueueInner>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl DrawQueue {
    pub fn new(sink: Arc<dyn CommandSink>, viewport: (f64, f64)) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                sink,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                cache: Mutex::new(LayoutCache::default()),
                viewport: Mutex::new(viewport),
                last_offset: Mutex::new(0.0),
                pending_direct: Mutex::new(None),
            }),
            consumer: Mutex::new(None),
        }
    }

    pub async fn set_viewport(&self, width: f64, height: f64) {
        *self.inner.viewport.lock().await = (width, height);
    }

    /// Enqueue an action at `offset` seconds within the current batch and
    /// make sure the consumer is running.  Offsets are monotonic per batch,
    /// so a FIFO is sufficient.
    pub async fn schedule(&self, offset: f64, action: DrawAction) {
        self.inner.queue.lock().await.push_back((offset, action));
        self.inner.notify.notify_one();
        self.ensure_consumer().await;
    }

    /// Clear the queue, cancel the consumer, and reset layout state.
    pub async fn stop_all_actions(&self) {
        if let Some(handle) = self.consumer.lock().await.take() {
            handle.abort();
        }
        self.inner.queue.lock().await.clear();
        self.inner.cache.lock().await.clear();
        *self.inner.last_offset.lock().await = 0.0;
        *self.inner.pending_direct.lock().await = None;
        debug!("draw queue stopped and cleared");
    }

    /// Number of queued, not-yet-executed actions.
    pub async fn pending(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    async fn ensure_consumer(&self) {
        let mut guard = self.consumer.lock().await;
        let running = guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(async move {
            consume(inner).await;
        }));
    }
}

async fn consume(inner: Arc<QueueInner>) {
    loop {
        // Wait until the queue is non-empty.  An empty queue ends the
        // current batch, so the offset cursor resets.
        loop {
            if !inner.queue.lock().await.is_empty() {
                break;
            }
            *inner.last_offset.lock().await = 0.0;
            inner.notify.notified().await;
        }

        // A displayed direct response blocks the next action until its
        // minimum display time has elapsed, then gets hidden.
        let pending = inner.pending_direct.lock().await.take();
        if let Some((shown_at, id)) = pending {
            let elapsed = shown_at.elapsed();
            if elapsed < DIRECT_RESPONSE_MIN_DISPLAY {
                tokio::time::sleep(DIRECT_RESPONSE_MIN_DISPLAY - elapsed).await;
            }
            inner.cache.lock().await.remove(&id);
            inner.sink.send(OverlayCommand::RemoveText { id }).await;
        }

        let (offset, action) = match inner.queue.lock().await.pop_front() {
            Some(entry) => entry,
            None => continue,
        };

        let last = *inner.last_offset.lock().await;
        let delta = offset - last;
        if delta > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delta)).await;
        }
        *inner.last_offset.lock().await = offset.max(last);

        execute(&inner, action).await;
    }
}

fn short_id(prefix: &str) -> String {
    format!("{prefix}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

async fn execute(inner: &QueueInner, action: DrawAction) {
    let viewport = *inner.viewport.lock().await;
    match action {
        DrawAction::BoundingBox {
            y_min,
            x_min,
            y_max,
            x_max,
            id,
            stroke,
            stroke_width,
            opacity,
            auto_contrast,
            fill,
        } => {
            let (vw, vh) = viewport;
            let top = normalize_to_pixels(y_min, vh);
            let left = normalize_to_pixels(x_min, vw);
            let bottom = normalize_to_pixels(y_max, vh);
            let right = normalize_to_pixels(x_max, vw);
            inner
                .sink
                .send(OverlayCommand::DrawBox {
                    id: id.unwrap_or_else(|| short_id("box")),
                    x: left.min(right),
                    y: top.min(bottom),
                    width: (right - left).abs(),
                    height: (bottom - top).abs(),
                    stroke_width,
                    opacity,
                    stroke,
                    fill,
                    auto_contrast,
                })
                .await;
        }
        DrawAction::Text {
            x,
            y,
            text,
            id,
            font_size,
            align,
            baseline,
            source,
        } => {
            let id = id.unwrap_or_else(|| short_id("text"));
            let anchor = TextAnchor::parse(&align, &baseline);
            send_text(inner, viewport, id, x, y, text, font_size, anchor, source).await;
        }
        DrawAction::Dot { x, y, radius, color, id } => {
            let (vw, vh) = viewport;
            inner
                .sink
                .send(OverlayCommand::DrawDot {
                    id: id.unwrap_or_else(|| short_id("dot")),
                    x: normalize_to_pixels(x, vw),
                    y: normalize_to_pixels(y, vh),
                    radius,
                    color,
                })
                .await;
        }
        DrawAction::RemoveBox { id } => {
            inner.sink.send(OverlayCommand::RemoveBox { id }).await;
        }
        DrawAction::RemoveText { id } => {
            inner.cache.lock().await.remove(&id);
            inner.sink.send(OverlayCommand::RemoveText { id }).await;
        }
        DrawAction::RemoveDot { id } => {
            inner.sink.send(OverlayCommand::RemoveDot { id }).await;
        }
        DrawAction::Clear => {
            inner.cache.lock().await.clear();
            *inner.pending_direct.lock().await = None;
            inner.sink.send(OverlayCommand::Clear).await;
        }
        DrawAction::DirectResponse { text, source } => {
            let (vw, vh) = viewport;
            let id = short_id("direct");
            send_text(
                inner,
                viewport,
                id.clone(),
                vw / 2.0,
                vh / 2.0,
                text,
                DEFAULT_FONT_SIZE,
                TextAnchor { align: Align::Center, baseline: Baseline::Middle },
                source,
            )
            .await;
            *inner.pending_direct.lock().await = Some((Instant::now(), id));
        }
    }
}

/// Run a text draw through the layout: estimate, resolve, place against the
/// live rectangle cache, then ship the frame anchored at the placed rect.
#[allow(clippy::too_many_arguments)]
async fn send_text(
    inner: &QueueInner,
    viewport: (f64, f64),
    id: String,
    x: f64,
    y: f64,
    text: String,
    font_size: u32,
    anchor: TextAnchor,
    source: Option<String>,
) {
    let (vw, vh) = viewport;
    let ax = normalize_to_pixels(x, vw);
    let ay = normalize_to_pixels(y, vh);
    let size = estimate_panel_size(&text, font_size);
    let requested = resolve_anchor_rect(ax, ay, size, anchor, viewport);

    let placed = {
        let mut cache = inner.cache.lock().await;
        let placed = cache.place(requested, viewport);
        cache.insert(id.clone(), placed);
        placed
    };

    let (anchor_x, anchor_y) = anchor_point(&placed, anchor);
    inner
        .sink
        .send(OverlayCommand::DrawText {
            id,
            x: anchor_x,
            y: anchor_y,
            text,
            font_size,
            font_family: DEFAULT_FONT_FAMILY.into(),
            align: match anchor.align {
                Align::Left => "left",
                Align::Center => "center",
                Align::Right => "right",
            }
            .into(),
            baseline: match anchor.baseline {
                Baseline::Top => "top",
                Baseline::Middle => "middle",
                Baseline::Bottom => "bottom",
            }
            .into(),
            source,
            theme: None,
            color: None,
        })
        .await;
}

/// Invert the anchor resolution: where must the anchor point sit so the
/// panel renders exactly at `rect`.
fn anchor_point(rect: &Rect, anchor: TextAnchor) -> (f64, f64) {
    let x = match anchor.align {
        Align::Left => rect.x,
        Align::Center => rect.x + rect.width / 2.0,
        Align::Right => rect.x + rect.width,
    };
    let y = match anchor.baseline {
        Baseline::Top => rect.y,
        Baseline::Middle => rect.y + rect.height / 2.0,
        Baseline::Bottom => rect.y + rect.height,
    };
    (x, y)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        commands: StdMutex<Vec<OverlayCommand>>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send(&self, command: OverlayCommand) {
            self.commands.lock().unwrap().push(command);
        }
    }

    impl RecordingSink {
        fn drained(&self) -> Vec<OverlayCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    async fn wait_for_commands(sink: &RecordingSink, count: usize) {
        for _ in 0..500 {
            if sink.commands.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} commands, got {}",
            sink.commands.lock().unwrap().len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn actions_execute_in_offset_order() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DrawQueue::new(sink.clone(), (1920.0, 1080.0));

        queue
            .schedule(0.0, DrawAction::Dot { x: 1.0, y: 2.0, radius: 6.0, color: None, id: Some("d1".into()) })
            .await;
        queue
            .schedule(0.5, DrawAction::Dot { x: 3.0, y: 4.0, radius: 6.0, color: None, id: Some("d2".into()) })
            .await;

        wait_for_commands(&sink, 2).await;
        let cmds = sink.drained();
        assert!(matches!(&cmds[0], OverlayCommand::DrawDot { id, .. } if id == "d1"));
        assert!(matches!(&cmds[1], OverlayCommand::DrawDot { id, .. } if id == "d2"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_offset_texts_do_not_overlap() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DrawQueue::new(sink.clone(), (1920.0, 1080.0));

        for i in 0..3 {
            queue
                .schedule(
                    0.0,
                    DrawAction::Text {
                        x: 500.0,
                        y: 400.0,
                        text: "label".into(),
                        id: Some(format!("t{i}")),
                        font_size: 16,
                        align: "center".into(),
                        baseline: "middle".into(),
                        source: None,
                    },
                )
                .await;
        }
        wait_for_commands(&sink, 3).await;

        let cache = queue.inner.cache.lock().await;
        let rects: Vec<Rect> = cache.rects().copied().collect();
        assert_eq!(rects.len(), 3);
        for (i, a) in rects.iter().enumerate() {
            for b in rects.iter().skip(i + 1) {
                assert!(!a.overlaps(b), "live text panels must stay disjoint");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bounding_box_normalizes_per_mille_coords() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DrawQueue::new(sink.clone(), (1000.0, 1000.0));
        queue
            .schedule(
                0.0,
                DrawAction::BoundingBox {
                    y_min: 100.0,
                    x_min: 200.0,
                    y_max: 300.0,
                    x_max: 400.0,
                    id: Some("b".into()),
                    stroke: None,
                    stroke_width: 5,
                    opacity: 0.8,
                    auto_contrast: false,
                    fill: None,
                },
            )
            .await;
        wait_for_commands(&sink, 1).await;
        match &sink.drained()[0] {
            OverlayCommand::DrawBox { x, y, width, height, .. } => {
                assert_eq!((*x, *y), (200.0, 100.0));
                assert_eq!((*width, *height), (200.0, 200.0));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn direct_response_is_hidden_after_min_display() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DrawQueue::new(sink.clone(), (1920.0, 1080.0));

        queue
            .schedule(0.0, DrawAction::DirectResponse { text: "4".into(), source: Some("rapid".into()) })
            .await;
        wait_for_commands(&sink, 1).await;

        // The next action forces the ≥4 s display window, then the hide.
        queue
            .schedule(0.0, DrawAction::Dot { x: 1.0, y: 1.0, radius: 4.0, color: None, id: Some("d".into()) })
            .await;
        wait_for_commands(&sink, 3).await;

        let cmds = sink.drained();
        assert!(matches!(&cmds[0], OverlayCommand::DrawText { .. }));
        assert!(matches!(&cmds[1], OverlayCommand::RemoveText { .. }));
        assert!(matches!(&cmds[2], OverlayCommand::DrawDot { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_actions_clears_queue_and_cache() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DrawQueue::new(sink.clone(), (1920.0, 1080.0));

        queue
            .schedule(
                60.0,
                DrawAction::Text {
                    x: 10.0,
                    y: 10.0,
                    text: "never drawn".into(),
                    id: None,
                    font_size: 16,
                    align: "left".into(),
                    baseline: "top".into(),
                    source: None,
                },
            )
            .await;
        queue.stop_all_actions().await;
        assert_eq!(queue.pending().await, 0);
        assert!(queue.inner.cache.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_text_frees_layout_slot() {
        let sink = Arc::new(RecordingSink::default());
        let queue = DrawQueue::new(sink.clone(), (1920.0, 1080.0));
        queue
            .schedule(
                0.0,
                DrawAction::Text {
                    x: 100.0,
                    y: 100.0,
                    text: "a".into(),
                    id: Some("t1".into()),
                    font_size: 16,
                    align: "left".into(),
                    baseline: "top".into(),
                    source: None,
                },
            )
            .await;
        queue.schedule(0.0, DrawAction::RemoveText { id: "t1".into() }).await;
        wait_for_commands(&sink, 2).await;
        assert!(queue.inner.cache.lock().await.is_empty());
    }
}
