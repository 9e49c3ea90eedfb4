// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clovis_agents::{
    Agent, BrowserAgent, CaptureContext, CdpLauncher, ClovisAgent, CliAgent, EnigoInput,
    ExternalAutomation, ProcessManager, ScreenCapture, StatusTx, TtsClient, VisionAgent,
};
use clovis_config::Settings;
use clovis_model::{GoogleInvoker, ModelInvoker};
use clovis_overlay::{
    CommandSink, DrawQueue, OverlayCommand, OverlayEvent, OverlayHandle, OverlayServer,
};
use clovis_router::{AgentKind, Router, ScreenshotSource};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // First touch registers the at-exit SIGTERM hook for promoted servers.
    let _ = ProcessManager::global();

    let config_path = cli.config.clone();
    let mut settings = clovis_config::load(config_path.as_deref())?;
    if let Some(host) = &cli.host {
        settings.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }

    // Free-port bootstrap: the overlay renderer reads the final value from
    // settings.json, so the chosen port is persisted before serving.
    settings.port = clovis_config::pick_listen_port(&settings.host, settings.port)?;
    if settings.screen_width == 0 || settings.screen_height == 0 {
        let (w, h) = settings.screen_size();
        info!(width = w, height = h, "no screen size recorded, using fallback");
        settings.screen_width = w;
        settings.screen_height = h;
    }
    clovis_config::save(&settings, config_path.as_deref())?;

    info!(
        rapid = %settings.rapid_response_model,
        clovis = %settings.clovis_model,
        "models loaded"
    );

    let (handle, mut events, addr) =
        OverlayServer::start(&settings.host, settings.port, settings.screen_size()).await?;
    info!("overlay transport listening at ws://{addr}");

    let sink: Arc<dyn CommandSink> = Arc::new(handle.clone());
    let (vw, vh) = settings.viewport_size();
    let queue = Arc::new(DrawQueue::new(Arc::clone(&sink), (vw as f64, vh as f64)));

    let rapid_model: Arc<dyn ModelInvoker> = Arc::new(
        GoogleInvoker::new(&settings.rapid_response_model).context("building router model")?,
    );
    let clovis_model: Arc<dyn ModelInvoker> = Arc::new(
        GoogleInvoker::new(&settings.clovis_model).context("building agent model")?,
    );

    let capture: Arc<dyn ScreenCapture> = Arc::new(OverlayCapture {
        handle: handle.clone(),
        screen_size: settings.screen_size(),
    });
    let tts = Arc::new(TtsClient::from_settings(&settings.tts));

    let mut router = Router::new(Arc::clone(&rapid_model), Arc::clone(&clovis_model))
        .with_sink(Arc::clone(&sink))
        .with_screenshots(Arc::new(OverlayScreenshots { handle: handle.clone() }))
        .with_personalization(settings.personalization.clone());

    // Annotation agent.
    let clovis_agent = Arc::new(
        ClovisAgent::new(Arc::clone(&clovis_model), Arc::clone(&queue), Arc::clone(&sink))
            .with_capture(Arc::clone(&capture)),
    );
    router = router.with_agent(AgentKind::Clovis, clovis_agent);

    // Browser agent: rich automation runtime (if configured) with the CDP
    // direct-driver fallback.
    let automation_runtime = std::env::var("CLOVIS_BROWSER_RUNTIME").ok().map(PathBuf::from);
    let browser_agent = Arc::new(
        BrowserAgent::new(
            Arc::new(ExternalAutomation::new(automation_runtime, &settings.clovis_model)),
            Arc::new(CdpLauncher::new()),
        )
        .with_status(status_forwarder(handle.clone(), "browser")),
    );
    router = router.with_agent(AgentKind::Browser, browser_agent);

    // CLI agent: requires the external runner bundle.
    let cli_root: PathBuf =
        std::env::var("CLOVIS_CLI_ROOT").map(PathBuf::from).unwrap_or_else(|_| "cua-cli".into());
    match CliAgent::new(cli_root, Some(settings.rapid_response_model.clone())) {
        Ok(agent) => {
            let agent = agent.with_status(status_forwarder(handle.clone(), "cua_cli"));
            router = router.with_agent(AgentKind::CuaCli, Arc::new(agent));
        }
        Err(e) => warn!("CLI agent unavailable: {e:#}"),
    }

    // Vision agent: requires a working input driver.
    let mut vision_stop = None;
    match EnigoInput::new() {
        Ok(input) => {
            let vision = Arc::new(
                VisionAgent::new(
                    Arc::clone(&clovis_model),
                    Arc::clone(&clovis_model),
                    Arc::clone(&capture),
                    Arc::new(input),
                )
                .with_sink(Arc::clone(&sink))
                .with_tts(Arc::clone(&tts)),
            );
            vision_stop = Some(vision.stop_flag());
            router = router.with_agent(AgentKind::CuaVision, Arc::clone(&vision) as Arc<dyn Agent>);
        }
        Err(e) => warn!("vision agent unavailable: {e:#}"),
    }

    let router = Arc::new(router);

    info!("waiting for overlay client connection...");
    handle.wait_for_client().await;
    info!("overlay client connected");

    // One router session at a time; a second input while one runs is
    // rejected with a visible notice.
    let mut current_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(event) = events.recv().await {
        match event {
            OverlayEvent::Input { text } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if current_task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
                    info!("overlay input ignored (task already running)");
                    sink.send(OverlayCommand::ShowStatusBubble {
                        text: "A task is already running.".into(),
                        source: "rapid".into(),
                        theme: None,
                    })
                    .await;
                    sink.send(OverlayCommand::HideStatusBubble { delay: 2000 }).await;
                    continue;
                }
                info!(%text, "overlay input accepted");
                let router = Arc::clone(&router);
                current_task = Some(tokio::spawn(async move {
                    let result = router.run_session(&text).await;
                    info!(steps = result.chain_steps.len(), "session complete");
                }));
            }
            OverlayEvent::StopAll => {
                info!("stop requested: cancelling active tasks");
                if let Some(stop) = &vision_stop {
                    stop.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                if let Some(task) = current_task.take() {
                    task.abort();
                }
                queue.stop_all_actions().await;
            }
            OverlayEvent::ViewportChanged { width, height } => {
                queue.set_viewport(width as f64, height as f64).await;
                settings.viewport_width = width;
                settings.viewport_height = height;
                settings.screen_width = width;
                settings.screen_height = height;
                if let Err(e) = clovis_config::save(&settings, config_path.as_deref()) {
                    warn!("failed to persist viewport size: {e:#}");
                }
            }
            OverlayEvent::CaptureRequested => {
                // Frames normally arrive attached to the capture event; a
                // bare request means the renderer expects a host capture,
                // which no backend provides here.
                tracing::debug!("capture requested but no host capture backend is wired");
            }
            OverlayEvent::Click { id } => {
                tracing::debug!(%id, "overlay entity clicked");
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("CLOVIS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Forward an agent's status stream into the status bubble.
fn status_forwarder(handle: OverlayHandle, source: &'static str) -> StatusTx {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(32);
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            handle
                .send(OverlayCommand::UpdateStatusBubble {
                    text,
                    source: source.into(),
                    theme: None,
                })
                .await;
        }
    });
    tx
}

/// Capture backed by the overlay screenshot cache: full-screen frames with
/// identity offsets.  OS-level window capture stays outside the core.
struct OverlayCapture {
    handle: OverlayHandle,
    screen_size: (u32, u32),
}

impl ScreenCapture for OverlayCapture {
    fn capture_active_window(&self) -> anyhow::Result<(image::RgbImage, CaptureContext)> {
        let handle = self.handle.clone();
        let image = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(handle.latest_screenshot())
        })
        .context("no screenshot has been captured yet")?;
        let (width, height) = image.dimensions();
        let mut ctx = CaptureContext::full_screen(width, height);
        // The renderer may capture at a different pixel density than the
        // logical screen size the input driver addresses.
        let (sw, sh) = self.screen_size;
        if sw > 0 && sh > 0 {
            ctx.logical_size = (sw as f64, sh as f64);
            ctx.scale = (width as f64 / sw as f64, height as f64 / sh as f64);
        }
        Ok((image, ctx))
    }

    fn active_window_title(&self) -> String {
        "Unknown".into()
    }
}

struct OverlayScreenshots {
    handle: OverlayHandle,
}

impl ScreenshotSource for OverlayScreenshots {
    fn latest(&self) -> Option<image::RgbImage> {
        let handle = self.handle.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(handle.latest_screenshot())
        })
    }
}
