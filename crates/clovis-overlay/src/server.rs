// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket bridge between the orchestrator and the overlay renderer.
//!
//! One axum route upgrades connections; outbound frames fan out to every
//! connected peer and stale peers are pruned on send failure.  Inbound
//! frames are lifecycle events (`overlay_input`, `viewport`,
//! `capture_screenshot`, `stop_all`, `click`); user input is de-duplicated
//! here so double-submits from rapid key/click interactions or websocket
//! reconnects never reach the router twice.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use base64::Engine as _;
use image::RgbImage;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::commands::{CommandSink, InboundEvent, OverlayCommand};
use crate::theme::{Theme, ThemeSampler};

/// Duplicate `requestId`s are dropped for this long.
const REQUEST_ID_TTL: Duration = Duration::from_secs(10);
/// Identical normalized text within this window is dropped.
const TEXT_DEDUP_WINDOW: Duration = Duration::from_millis(1200);

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEvent {
    /// A de-duplicated user command from the overlay input field.
    Input { text: String },
    StopAll,
    Click { id: String },
    ViewportChanged { width: u32, height: u32 },
    /// The renderer asked for a capture but attached no frame; the
    /// application should capture and call [`OverlayHandle::store_screenshot`].
    CaptureRequested,
}

#[derive(Default)]
struct DedupState {
    seen_request_ids: HashMap<String, Instant>,
    last_text: String,
    last_text_at: Option<Instant>,
}

impl DedupState {
    /// Apply the overlay_input de-duplication rules.  Returns `true` when
    /// the event should be delivered.  When a `requestId` is present it is
    /// the only rule consulted.
    fn admit(&mut self, text: &str, request_id: Option<&str>, now: Instant) -> bool {
        if let Some(rid) = request_id.filter(|r| !r.is_empty()) {
            self.seen_request_ids
                .retain(|_, seen| now.duration_since(*seen) <= REQUEST_ID_TTL);
            if self.seen_request_ids.contains_key(rid) {
                return false;
            }
            self.seen_request_ids.insert(rid.to_string(), now);
            return true;
        }

        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !normalized.is_empty()
            && normalized == self.last_text
            && self
                .last_text_at
                .map(|t| now.duration_since(t) < TEXT_DEDUP_WINDOW)
                .unwrap_or(false)
        {
            return false;
        }
        self.last_text = normalized;
        self.last_text_at = Some(now);
        true
    }
}

struct ServerState {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_client_id: AtomicU64,
    // Enriched frames by entity id, replayed to newly connected clients.
    boxes: Mutex<HashMap<String, String>>,
    texts: Mutex<HashMap<String, String>>,
    dots: Mutex<HashMap<String, String>>,
    sampler: Mutex<ThemeSampler>,
    active_status_theme: Mutex<Option<Theme>>,
    screen_size: Mutex<(u32, u32)>,
    dedup: Mutex<DedupState>,
    events: mpsc::Sender<OverlayEvent>,
}

/// Cloneable handle to the running overlay server.
#[derive(Clone)]
pub struct OverlayHandle {
    state: Arc<ServerState>,
}

pub struct OverlayServer;

impl OverlayServer {
    /// Bind the WebSocket listener and start serving.
    ///
    /// Returns the handle, the event stream, and the address actually bound
    /// (the port may differ from the configured one after free-port
    /// selection upstream).
    pub async fn start(
        host: &str,
        port: u16,
        screen_size: (u32, u32),
    ) -> anyhow::Result<(OverlayHandle, mpsc::Receiver<OverlayEvent>, SocketAddr)> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let state = Arc::new(ServerState {
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            boxes: Mutex::new(HashMap::new()),
            texts: Mutex::new(HashMap::new()),
            dots: Mutex::new(HashMap::new()),
            sampler: Mutex::new(ThemeSampler::default()),
            active_status_theme: Mutex::new(None),
            screen_size: Mutex::new(screen_size),
            dedup: Mutex::new(DedupState::default()),
            events: events_tx,
        });

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .with_context(|| format!("binding overlay listener on {host}:{port}"))?;
        let addr = listener.local_addr().context("reading bound address")?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("overlay server stopped: {e}");
            }
        });

        info!(%addr, "overlay transport listening");
        Ok((OverlayHandle { state }, events_rx, addr))
    }
}

impl OverlayHandle {
    /// Store a screenshot frame for theming decisions.
    pub async fn store_screenshot(&self, image: RgbImage) {
        self.state.sampler.lock().await.store_screenshot(image);
    }

    /// The most recent stored frame, if any.  Readers never block capture:
    /// this clones the latest version out of the sampler.
    pub async fn latest_screenshot(&self) -> Option<RgbImage> {
        self.state.sampler.lock().await.screenshot().cloned()
    }

    pub async fn set_screen_size(&self, width: u32, height: u32) {
        *self.state.screen_size.lock().await = (width, height);
    }

    pub async fn client_count(&self) -> usize {
        self.state.clients.lock().await.len()
    }

    /// Block until at least one overlay client is connected.
    pub async fn wait_for_client(&self) {
        loop {
            if self.client_count().await > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Ingest one inbound frame.  Used by the socket loop and by tests.
    pub async fn ingest(&self, event: InboundEvent) {
        match event {
            InboundEvent::OverlayInput { text, request_id } => {
                let admitted = self
                    .state
                    .dedup
                    .lock()
                    .await
                    .admit(&text, request_id.as_deref(), Instant::now());
                if !admitted {
                    debug!(%text, "overlay input dropped as duplicate");
                    return;
                }
                let _ = self.state.events.send(OverlayEvent::Input { text }).await;
            }
            InboundEvent::Viewport { width, height } => {
                debug!(width, height, "viewport reported");
                if width > 0 && height > 0 {
                    *self.state.screen_size.lock().await = (width, height);
                    let _ = self
                        .state
                        .events
                        .send(OverlayEvent::ViewportChanged { width, height })
                        .await;
                }
            }
            InboundEvent::CaptureScreenshot { data } => match data {
                Some(url) => match decode_data_url(&url) {
                    Some(image) => self.store_screenshot(image).await,
                    // Undecodable frames are dropped silently.
                    None => debug!("dropping undecodable screenshot frame"),
                },
                None => {
                    let _ = self.state.events.send(OverlayEvent::CaptureRequested).await;
                }
            },
            InboundEvent::StopAll => {
                let _ = self.state.events.send(OverlayEvent::StopAll).await;
            }
            InboundEvent::Click { id } => {
                debug!(%id, "overlay entity clicked");
                let _ = self.state.events.send(OverlayEvent::Click { id }).await;
            }
        }
    }

    /// Serialize and fan a frame out to every peer, pruning dead ones.
    async fn broadcast(&self, frame: &str) {
        let mut clients = self.state.clients.lock().await;
        clients.retain(|id, tx| {
            let alive = tx.send(frame.to_string()).is_ok();
            if !alive {
                debug!(client = *id, "pruning stale overlay client");
            }
            alive
        });
    }

    /// Apply theme enrichment and registry bookkeeping, then broadcast.
    async fn dispatch(&self, mut command: OverlayCommand) {
        match &mut command {
            OverlayCommand::DrawBox {
                x,
                y,
                width,
                height,
                stroke,
                auto_contrast,
                ..
            } => {
                if *auto_contrast {
                    let theme = {
                        let mut sampler = self.state.sampler.lock().await;
                        sampler.theme_for_point(*x + *width / 2.0, *y + *height / 2.0)
                    };
                    *stroke = Some(theme.box_stroke);
                }
            }
            OverlayCommand::DrawText { x, y, theme, color, .. } => {
                let sampled = self.state.sampler.lock().await.theme_for_text(*x, *y);
                *color = Some(sampled.accent.clone());
                *theme = Some(sampled);
            }
            OverlayCommand::ShowStatusBubble { theme, .. } => {
                let resolved = match theme.take() {
                    Some(t) => t,
                    None => {
                        let size = *self.state.screen_size.lock().await;
                        self.state.sampler.lock().await.theme_for_status(size)
                    }
                };
                *self.state.active_status_theme.lock().await = Some(resolved.clone());
                *theme = Some(resolved);
            }
            OverlayCommand::UpdateStatusBubble { theme, .. }
            | OverlayCommand::CompleteStatusBubble { theme, .. } => {
                let resolved = match theme.take() {
                    Some(t) => t,
                    None => match self.state.active_status_theme.lock().await.clone() {
                        Some(t) => t,
                        None => {
                            let size = *self.state.screen_size.lock().await;
                            self.state.sampler.lock().await.theme_for_status(size)
                        }
                    },
                };
                *self.state.active_status_theme.lock().await = Some(resolved.clone());
                *theme = Some(resolved);
            }
            OverlayCommand::HideStatusBubble { .. } => {
                *self.state.active_status_theme.lock().await = None;
            }
            OverlayCommand::ShowCursorStatus { theme, .. }
            | OverlayCommand::UpdateCursorStatus { theme, .. } => {
                if theme.is_none() {
                    *theme = Some(self.state.sampler.lock().await.theme_for_cursor());
                }
            }
            OverlayCommand::SetCursorStatusPosition { x, y } => {
                self.state.sampler.lock().await.set_cursor_pos(*x, *y);
            }
            OverlayCommand::Clear => {
                self.state.boxes.lock().await.clear();
                self.state.texts.lock().await.clear();
                self.state.dots.lock().await.clear();
                *self.state.active_status_theme.lock().await = None;
            }
            _ => {}
        }

        let frame = match serde_json::to_string(&command) {
            Ok(f) => f,
            Err(e) => {
                warn!("failed to serialize overlay command: {e}");
                return;
            }
        };

        // Registry upkeep so late-joining clients can be replayed.
        match &command {
            OverlayCommand::DrawBox { id, .. } => {
                self.state.boxes.lock().await.insert(id.clone(), frame.clone());
            }
            OverlayCommand::DrawText { id, .. } => {
                self.state.texts.lock().await.insert(id.clone(), frame.clone());
            }
            OverlayCommand::DrawDot { id, .. } => {
                self.state.dots.lock().await.insert(id.clone(), frame.clone());
            }
            OverlayCommand::RemoveBox { id } => {
                self.state.boxes.lock().await.remove(id);
            }
            OverlayCommand::RemoveText { id } => {
                self.state.texts.lock().await.remove(id);
            }
            OverlayCommand::RemoveDot { id } => {
                self.state.dots.lock().await.remove(id);
            }
            _ => {}
        }

        self.broadcast(&frame).await;
    }

    async fn snapshot_frames(&self) -> Vec<String> {
        let mut frames = Vec::new();
        frames.extend(self.state.boxes.lock().await.values().cloned());
        frames.extend(self.state.texts.lock().await.values().cloned());
        frames.extend(self.state.dots.lock().await.values().cloned());
        frames
    }
}

#[async_trait]
impl CommandSink for OverlayHandle {
    async fn send(&self, command: OverlayCommand) {
        self.dispatch(command).await;
    }
}

fn decode_data_url(url: &str) -> Option<RgbImage> {
    let (_, b64) = url.split_once(',')?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    let image = image::load_from_memory(&bytes).ok()?;
    Some(image.to_rgb8())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, OverlayHandle { state }))
}

async fn handle_socket(mut socket: WebSocket, handle: OverlayHandle) {
    let client_id = handle.state.next_client_id.fetch_add(1, Ordering::Relaxed);
    info!(client = client_id, "overlay client connected");

    // Replay the live entity registry to the new client.
    for frame in handle.snapshot_frames().await {
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    handle.state.clients.lock().await.insert(client_id, tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundEvent>(&text) {
                            Ok(event) => handle.ingest(event).await,
                            Err(e) => debug!(client = client_id, "ignoring frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(client = client_id, "overlay recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    handle.state.clients.lock().await.remove(&client_id);
    info!(client = client_id, "overlay client disconnected");
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_handle() -> (OverlayHandle, mpsc::Receiver<OverlayEvent>) {
        let (handle, events, _addr) = OverlayServer::start("127.0.0.1", 0, (1920, 1080))
            .await
            .unwrap();
        (handle, events)
    }

    // ── De-duplication ────────────────────────────────────────────────────────

    #[test]
    fn duplicate_request_id_within_ttl_is_dropped() {
        let mut d = DedupState::default();
        let now = Instant::now();
        assert!(d.admit("open spotify", Some("r-1"), now));
        assert!(!d.admit("open spotify", Some("r-1"), now + Duration::from_secs(3)));
    }

    #[test]
    fn request_id_expires_after_ttl() {
        let mut d = DedupState::default();
        let now = Instant::now();
        assert!(d.admit("x", Some("r-1"), now));
        assert!(d.admit("x", Some("r-1"), now + Duration::from_secs(11)));
    }

    #[test]
    fn same_text_within_window_is_dropped() {
        let mut d = DedupState::default();
        let now = Instant::now();
        assert!(d.admit("open  spotify", None, now));
        // Different whitespace, same normalized text, inside 1.2 s.
        assert!(!d.admit("open spotify", None, now + Duration::from_millis(500)));
        assert!(d.admit("open spotify", None, now + Duration::from_millis(1900)));
    }

    #[test]
    fn request_id_takes_precedence_over_text_rule() {
        let mut d = DedupState::default();
        let now = Instant::now();
        assert!(d.admit("same text", None, now));
        // With a requestId present only the requestId rule applies, so the
        // identical text inside the window is still admitted.
        assert!(d.admit("same text", Some("r-9"), now + Duration::from_millis(100)));
    }

    #[test]
    fn empty_text_is_not_tracked_for_dedup() {
        let mut d = DedupState::default();
        let now = Instant::now();
        assert!(d.admit("", None, now));
        assert!(d.admit("", None, now + Duration::from_millis(100)));
    }

    // ── Event ingestion ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn ingest_input_emits_exactly_one_event_for_duplicates() {
        let (handle, mut events) = test_handle().await;
        handle
            .ingest(InboundEvent::OverlayInput {
                text: "clone this repo".into(),
                request_id: Some("req-7".into()),
            })
            .await;
        handle
            .ingest(InboundEvent::OverlayInput {
                text: "clone this repo".into(),
                request_id: Some("req-7".into()),
            })
            .await;
        assert_eq!(
            events.recv().await,
            Some(OverlayEvent::Input { text: "clone this repo".into() })
        );
        assert!(events.try_recv().is_err(), "duplicate must not be delivered");
    }

    #[tokio::test]
    async fn ingest_viewport_updates_screen_size() {
        let (handle, mut events) = test_handle().await;
        handle.ingest(InboundEvent::Viewport { width: 2560, height: 1440 }).await;
        assert_eq!(
            events.recv().await,
            Some(OverlayEvent::ViewportChanged { width: 2560, height: 1440 })
        );
        assert_eq!(*handle.state.screen_size.lock().await, (2560, 1440));
    }

    #[tokio::test]
    async fn ingest_stop_all_forwards() {
        let (handle, mut events) = test_handle().await;
        handle.ingest(InboundEvent::StopAll).await;
        assert_eq!(events.recv().await, Some(OverlayEvent::StopAll));
    }

    #[tokio::test]
    async fn capture_without_frame_requests_capture() {
        let (handle, mut events) = test_handle().await;
        handle.ingest(InboundEvent::CaptureScreenshot { data: None }).await;
        assert_eq!(events.recv().await, Some(OverlayEvent::CaptureRequested));
    }

    #[tokio::test]
    async fn bad_screenshot_frame_is_dropped_silently() {
        let (handle, mut events) = test_handle().await;
        handle
            .ingest(InboundEvent::CaptureScreenshot {
                data: Some("data:image/png;base64,not-base64!!!".into()),
            })
            .await;
        assert!(events.try_recv().is_err());
        assert!(!handle.state.sampler.lock().await.has_screenshot());
    }

    // ── Dispatch enrichment ───────────────────────────────────────────────────

    fn flat(w: u32, h: u32, v: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb([v, v, v]))
    }

    #[tokio::test]
    async fn auto_contrast_box_gets_theme_stroke() {
        let (handle, _events) = test_handle().await;
        handle.store_screenshot(flat(400, 400, 10)).await;
        handle
            .send(OverlayCommand::DrawBox {
                id: "b1".into(),
                x: 100.0,
                y: 100.0,
                width: 50.0,
                height: 50.0,
                stroke_width: 5,
                opacity: 0.8,
                stroke: None,
                fill: None,
                auto_contrast: true,
            })
            .await;
        let boxes = handle.state.boxes.lock().await;
        let frame = boxes.get("b1").unwrap();
        // Dark sample → light-on-dark box stroke.
        assert!(frame.contains("rgba(102, 183, 255, 0.95)"), "{frame}");
    }

    #[tokio::test]
    async fn draw_text_is_enriched_with_theme() {
        let (handle, _events) = test_handle().await;
        handle.store_screenshot(flat(400, 400, 240)).await;
        handle
            .send(OverlayCommand::DrawText {
                id: "t1".into(),
                x: 100.0,
                y: 100.0,
                text: "hello".into(),
                font_size: 16,
                font_family: "system-ui".into(),
                align: "left".into(),
                baseline: "top".into(),
                source: Some("clovis".into()),
                theme: None,
                color: None,
            })
            .await;
        let texts = handle.state.texts.lock().await;
        let frame = texts.get("t1").unwrap();
        assert!(frame.contains("\"theme\""));
        assert!(frame.contains("\"color\""));
    }

    #[tokio::test]
    async fn status_theme_is_cached_across_updates() {
        let (handle, _events) = test_handle().await;
        handle.store_screenshot(flat(400, 400, 10)).await;
        handle
            .send(OverlayCommand::ShowStatusBubble {
                text: "Working...".into(),
                source: "cua_cli".into(),
                theme: None,
            })
            .await;
        let first = handle.state.active_status_theme.lock().await.clone().unwrap();

        // A very different screenshot must not change the active flow theme.
        handle.store_screenshot(flat(400, 400, 245)).await;
        handle
            .send(OverlayCommand::UpdateStatusBubble {
                text: "Running command: ls".into(),
                source: "cua_cli".into(),
                theme: None,
            })
            .await;
        let second = handle.state.active_status_theme.lock().await.clone().unwrap();
        assert_eq!(first, second, "update must reuse the cached flow theme");

        handle.send(OverlayCommand::HideStatusBubble { delay: 0 }).await;
        assert!(handle.state.active_status_theme.lock().await.is_none());
    }

    #[tokio::test]
    async fn clear_resets_registry_and_status_theme() {
        let (handle, _events) = test_handle().await;
        handle
            .send(OverlayCommand::DrawDot {
                id: "d1".into(),
                x: 5.0,
                y: 5.0,
                radius: 4.0,
                color: None,
            })
            .await;
        assert_eq!(handle.state.dots.lock().await.len(), 1);
        handle.send(OverlayCommand::Clear).await;
        assert!(handle.state.dots.lock().await.is_empty());
        assert!(handle.state.active_status_theme.lock().await.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_from_registry() {
        let (handle, _events) = test_handle().await;
        handle
            .send(OverlayCommand::DrawBox {
                id: "b".into(),
                x: 0.0,
                y: 0.0,
                width: 10.0,
                height: 10.0,
                stroke_width: 5,
                opacity: 0.8,
                stroke: Some("#73e331".into()),
                fill: None,
                auto_contrast: false,
            })
            .await;
        handle.send(OverlayCommand::RemoveBox { id: "b".into() }).await;
        assert!(handle.state.boxes.lock().await.is_empty());
    }
}
