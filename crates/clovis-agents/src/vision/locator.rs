// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Precision localization: crop-and-search and the legacy two-call locator.
//!
//! Crop-and-search zooms into a coarse region, asks a secondary locator
//! model for one tight bbox in 0–1000 coordinates *relative to the crop*,
//! and maps the center back to absolute screen coordinates.  The legacy
//! locator is the older full-screen variant kept as an internal fallback
//! when direct actions fail repeatedly.

use std::sync::OnceLock;

use anyhow::Context;
use image::RgbImage;
use regex::Regex;
use tracing::debug;

use clovis_model::{GenerationConfig, ModelInvoker, ModelRequest, RequestPart};
use clovis_overlay::normalize_to_pixels;

use super::{CaptureContext, ClickKind, InputDriver, ScreenCapture};

pub(crate) const MIN_CROP_SIZE_PX: f64 = 32.0;
pub(crate) const DEFAULT_CROP_PAD_PX: f64 = 400.0;

/// (ymin, xmin, ymax, xmax) in any supported coordinate band.
pub(crate) type BBox = (f64, f64, f64, f64);

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LocatedPoint {
    /// Absolute screen coordinates of the target center.
    pub x: f64,
    pub y: f64,
    /// The pixel crop actually sent to the locator model.
    pub crop_box: (u32, u32, u32, u32),
}

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.max(low).min(high)
}

/// Expand crop bounds by fixed padding.  When one side hits an edge and
/// rebalancing is on, the clipped padding shifts to the opposite side so
/// the target stays closer to the crop center.
fn apply_padding(
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
    width: f64,
    height: f64,
    pad: f64,
    rebalance: bool,
) -> (f64, f64, f64, f64) {
    let pad = pad.max(0.0);
    let raw_left = left - pad;
    let raw_right = right + pad;
    let raw_top = top - pad;
    let raw_bottom = bottom + pad;

    let mut padded_left = clamp(raw_left, 0.0, (width - 1.0).max(0.0));
    let mut padded_right = clamp(raw_right, 1.0, width.max(1.0));
    let mut padded_top = clamp(raw_top, 0.0, (height - 1.0).max(0.0));
    let mut padded_bottom = clamp(raw_bottom, 1.0, height.max(1.0));

    if rebalance {
        let left_clip = (padded_left - raw_left).max(0.0);
        let right_clip = (raw_right - padded_right).max(0.0);
        let top_clip = (padded_top - raw_top).max(0.0);
        let bottom_clip = (raw_bottom - padded_bottom).max(0.0);

        if left_clip > 0.0 {
            let room = (width - padded_right).max(0.0);
            padded_right += left_clip.min(room);
        }
        if right_clip > 0.0 {
            let room = padded_left.max(0.0);
            padded_left -= right_clip.min(room);
        }
        if top_clip > 0.0 {
            let room = (height - padded_bottom).max(0.0);
            padded_bottom += top_clip.min(room);
        }
        if bottom_clip > 0.0 {
            let room = padded_top.max(0.0);
            padded_top -= bottom_clip.min(room);
        }

        padded_left = clamp(padded_left, 0.0, (width - 1.0).max(0.0));
        padded_right = clamp(padded_right, 1.0, width.max(1.0));
        padded_top = clamp(padded_top, 0.0, (height - 1.0).max(0.0));
        padded_bottom = clamp(padded_bottom, 1.0, height.max(1.0));
    }

    (padded_left, padded_top, padded_right, padded_bottom)
}

/// Resolve coarse crop bounds into a pixel rectangle: normalize each edge,
/// sort, clamp, pad, and enforce the minimum crop size.
pub(crate) fn normalize_crop_box(
    bounds: BBox,
    width: u32,
    height: u32,
    pad: f64,
    rebalance: bool,
) -> (u32, u32, u32, u32) {
    let (w, h) = (width as f64, height as f64);
    let (ymin, xmin, ymax, xmax) = bounds;

    let mut top = normalize_to_pixels(ymin, h);
    let mut left = normalize_to_pixels(xmin, w);
    let mut bottom = normalize_to_pixels(ymax, h);
    let mut right = normalize_to_pixels(xmax, w);

    if left > right {
        std::mem::swap(&mut left, &mut right);
    }
    if top > bottom {
        std::mem::swap(&mut top, &mut bottom);
    }

    left = clamp(left, 0.0, (w - 1.0).max(0.0));
    right = clamp(right, 1.0, w.max(1.0));
    top = clamp(top, 0.0, (h - 1.0).max(0.0));
    bottom = clamp(bottom, 1.0, h.max(1.0));

    let (mut left, mut top, mut right, mut bottom) =
        apply_padding(left, top, right, bottom, w, h, pad, rebalance);

    if right - left < MIN_CROP_SIZE_PX {
        let center = (left + right) / 2.0;
        left = clamp(center - MIN_CROP_SIZE_PX / 2.0, 0.0, (w - MIN_CROP_SIZE_PX).max(0.0));
        right = clamp(left + MIN_CROP_SIZE_PX, 1.0, w.max(1.0));
    }
    if bottom - top < MIN_CROP_SIZE_PX {
        let center = (top + bottom) / 2.0;
        top = clamp(center - MIN_CROP_SIZE_PX / 2.0, 0.0, (h - MIN_CROP_SIZE_PX).max(0.0));
        bottom = clamp(top + MIN_CROP_SIZE_PX, 1.0, h.max(1.0));
    }

    (
        left.round() as u32,
        top.round() as u32,
        right.round() as u32,
        bottom.round() as u32,
    )
}

/// Pull the first four numbers out of a model reply.
pub(crate) fn parse_bbox(text: &str) -> anyhow::Result<BBox> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let number = NUMBER.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").unwrap());
    let values: Vec<f64> = number
        .find_iter(text)
        .take(4)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if values.len() < 4 {
        anyhow::bail!("could not parse bounding box from model response: {text:?}");
    }
    Ok((values[0], values[1], values[2], values[3]))
}

pub(crate) fn png_bytes(image: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("encoding capture as PNG")?;
    Ok(bytes)
}

/// Crop the screenshot, localize `target` inside the crop with the
/// secondary model, and return the target center in screen coordinates.
pub(crate) async fn crop_and_search(
    screenshot: &RgbImage,
    ctx: &CaptureContext,
    bounds: BBox,
    target: &str,
    model: &dyn ModelInvoker,
) -> anyhow::Result<LocatedPoint> {
    let (width, height) = screenshot.dimensions();
    let (left, top, right, bottom) =
        normalize_crop_box(bounds, width, height, DEFAULT_CROP_PAD_PX, true);
    let crop_w = right.saturating_sub(left);
    let crop_h = bottom.saturating_sub(top);
    if crop_w <= 1 || crop_h <= 1 {
        anyhow::bail!("invalid crop region after normalization");
    }
    let cropped = image::imageops::crop_imm(screenshot, left, top, crop_w, crop_h).to_image();

    let prompt = format!(
        "You are localizing a single clickable UI target inside a cropped screenshot.\n\
         Target: {target}\n\n\
         Return ONLY one bounding box in this exact format:\n\
         [ymin, xmin, ymax, xmax]\n\n\
         Rules:\n\
         - Coordinates must be normalized to 0-1000 relative to THIS CROPPED image.\n\
         - Box should tightly contain one clickable element.\n\
         - Output only the bracketed array, no extra text."
    );

    let mut request = ModelRequest::from_text(prompt).with_config(GenerationConfig::locator());
    request.parts.insert(0, RequestPart::png(&png_bytes(&cropped)?));
    let response = model.generate(request).await.context("locator model call")?;

    let (lymin, lxmin, lymax, lxmax) = parse_bbox(&response.text)?;
    let (cw, ch) = (crop_w as f64, crop_h as f64);
    let mut local_top = normalize_to_pixels(lymin, ch);
    let mut local_left = normalize_to_pixels(lxmin, cw);
    let mut local_bottom = normalize_to_pixels(lymax, ch);
    let mut local_right = normalize_to_pixels(lxmax, cw);
    if local_left > local_right {
        std::mem::swap(&mut local_left, &mut local_right);
    }
    if local_top > local_bottom {
        std::mem::swap(&mut local_top, &mut local_bottom);
    }
    local_left = clamp(local_left, 0.0, (cw - 1.0).max(0.0));
    local_right = clamp(local_right, 1.0, cw.max(1.0));
    local_top = clamp(local_top, 0.0, (ch - 1.0).max(0.0));
    local_bottom = clamp(local_bottom, 1.0, ch.max(1.0));

    let center_x_in_crop = local_left + (local_right - local_left) / 2.0;
    let center_y_in_crop = local_top + (local_bottom - local_top) / 2.0;
    let (x, y) = ctx.image_to_screen(
        left as f64 + center_x_in_crop,
        top as f64 + center_y_in_crop,
    );

    debug!(x, y, ?bounds, "crop-and-search localized target");
    Ok(LocatedPoint {
        x,
        y,
        crop_box: (left, top, right, bottom),
    })
}

/// Legacy two-call locator: one full-capture localization call, then a
/// cursor move and click.  Kept as the fallback path when direct actions
/// loop without progress.
pub(crate) async fn legacy_find_and_click(
    click: ClickKind,
    target: &str,
    capture: &dyn ScreenCapture,
    model: &dyn ModelInvoker,
    input: &dyn InputDriver,
) -> anyhow::Result<()> {
    let (screenshot, ctx) = capture.capture_active_window()?;
    let window_title = capture.active_window_title();

    let prompt = format!(
        "This image is a screenshot of {window_title} - an application that contains many \
         interactive elements.\n\n\
         Give me a very in depth description of everything you see in this image. Include all \
         icons that you may see such as search bars or home buttons, colors, position relative \
         to one another and the screen, etc.\n\
         Describe what you suspect the purpose of every single element in the image may be \
         responsible for.\n\n\
         Now use this description to assist your response, but no matter what do not reveal any \
         of this description unless prompted to do so.\n\
         Please keep in mind that only one element can be pressed. Your bounding box should only \
         contain at most one clickable element.\n\
         Return a bounding box for the {target}. Do NOT output any words:\n\
         [ymin, xmin, ymax, xmax]"
    );

    let mut request = ModelRequest::from_text(prompt).with_config(GenerationConfig::locator());
    request.parts.insert(0, RequestPart::png(&png_bytes(&screenshot)?));
    let response = model.generate(request).await.context("legacy locator call")?;

    let (ymin, xmin, ymax, xmax) = parse_bbox(&response.text)?;
    let (width, height) = screenshot.dimensions();
    let top = ymin / 1000.0 * height as f64;
    let left = xmin / 1000.0 * width as f64;
    let bottom = ymax / 1000.0 * height as f64;
    let right = xmax / 1000.0 * width as f64;

    let center_x = left + (right - left) / 2.0;
    let center_y = top + (bottom - top) / 2.0;
    let (x, y) = ctx.image_to_screen(center_x, center_y);

    input.move_cursor(x, y)?;
    input.click(click)?;
    debug!(x, y, %target, "legacy locator clicked");
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
