// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Text panel layout: rectangle estimation and non-overlap placement.
//!
//! Every text panel the queue draws is first resolved into an absolute
//! rectangle using the renderer's sizing model, then placed so that live
//! text panels never overlap when a free spot exists within the search
//! budget.

use std::collections::HashMap;

// Renderer sizing model.
const MAX_CONTENT_WIDTH: f64 = 280.0;
const MAX_PANEL_WIDTH: f64 = 320.0;
const LINE_HEIGHT_FACTOR: f64 = 1.6;
const HORIZONTAL_PADDING: f64 = 40.0;
const VERTICAL_PADDING: f64 = 32.0;
const MIN_PANEL_WIDTH: f64 = 96.0;
const MIN_PANEL_HEIGHT: f64 = 44.0;
/// Average glyph advance relative to the font size.
const CHAR_WIDTH_FACTOR: f64 = 0.6;

const VIEWPORT_MARGIN: f64 = 8.0;
/// Search grid pitch for collision avoidance.
const SEARCH_GRID: f64 = 28.0;
const SEARCH_RINGS: u32 = 10;

/// Axis-aligned rectangle in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    /// Area of the intersection with `other` (0 when disjoint).
    pub fn overlap_area(&self, other: &Rect) -> f64 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    fn offset(&self, dx: f64, dy: f64) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    fn clamp_to(&self, viewport: (f64, f64)) -> Rect {
        let (vw, vh) = viewport;
        let max_x = (vw - self.width - VIEWPORT_MARGIN).max(VIEWPORT_MARGIN);
        let max_y = (vh - self.height - VIEWPORT_MARGIN).max(VIEWPORT_MARGIN);
        Rect::new(
            self.x.clamp(VIEWPORT_MARGIN, max_x),
            self.y.clamp(VIEWPORT_MARGIN, max_y),
            self.width,
            self.height,
        )
    }
}

/// Horizontal alignment and vertical baseline of a text anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextAnchor {
    pub align: Align,
    pub baseline: Baseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Baseline {
    Top,
    #[default]
    Middle,
    Bottom,
}

impl TextAnchor {
    pub fn parse(align: &str, baseline: &str) -> Self {
        let align = match align {
            "left" => Align::Left,
            "right" => Align::Right,
            _ => Align::Center,
        };
        let baseline = match baseline {
            "top" => Baseline::Top,
            "bottom" => Baseline::Bottom,
            _ => Baseline::Middle,
        };
        Self { align, baseline }
    }
}

/// Convert a coordinate into pixels for one axis.
///
/// Bands: `[0, 1]` is a ratio of the axis size, `(1, 1000]` is per-mille,
/// anything larger is already absolute pixels.  The same rule applies to
/// bounding-box tool arguments.
pub fn normalize_to_pixels(value: f64, size: f64) -> f64 {
    if (0.0..=1.0).contains(&value) {
        value * size
    } else if (0.0..=1000.0).contains(&value) {
        value / 1000.0 * size
    } else {
        value
    }
}

/// Estimate the rendered panel size for `text` at `font_size`.
pub fn estimate_panel_size(text: &str, font_size: u32) -> (f64, f64) {
    let font = font_size.max(1) as f64;
    let char_width = font * CHAR_WIDTH_FACTOR;
    let chars_per_line = (MAX_CONTENT_WIDTH / char_width).floor().max(1.0);

    let mut lines = 0usize;
    let mut longest_line_chars = 0usize;
    for raw_line in text.split('\n') {
        let count = raw_line.chars().count();
        if count == 0 {
            lines += 1;
            continue;
        }
        lines += ((count as f64) / chars_per_line).ceil() as usize;
        longest_line_chars = longest_line_chars.max(count.min(chars_per_line as usize));
    }
    let lines = lines.max(1);

    let content_width = (longest_line_chars as f64 * char_width).min(MAX_CONTENT_WIDTH);
    let width = (content_width + HORIZONTAL_PADDING)
        .clamp(MIN_PANEL_WIDTH, MAX_PANEL_WIDTH);
    let height = (lines as f64 * font * LINE_HEIGHT_FACTOR + VERTICAL_PADDING)
        .max(MIN_PANEL_HEIGHT);
    (width, height)
}

/// Resolve an anchor point into the panel's absolute rectangle, clamped to
/// the viewport margin.
pub fn resolve_anchor_rect(
    x: f64,
    y: f64,
    size: (f64, f64),
    anchor: TextAnchor,
    viewport: (f64, f64),
) -> Rect {
    let (w, h) = size;
    let left = match anchor.align {
        Align::Left => x,
        Align::Center => x - w / 2.0,
        Align::Right => x - w,
    };
    let top = match anchor.baseline {
        Baseline::Top => y,
        Baseline::Middle => y - h / 2.0,
        Baseline::Bottom => y - h,
    };
    Rect::new(left, top, w, h).clamp_to(viewport)
}

/// Live text-panel rectangles, keyed by text id.
#[derive(Debug, Default)]
pub struct LayoutCache {
    rects: HashMap<String, Rect>,
}

impl LayoutCache {
    pub fn insert(&mut self, id: impl Into<String>, rect: Rect) {
        self.rects.insert(id.into(), rect);
    }

    pub fn remove(&mut self, id: &str) {
        self.rects.remove(id);
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> impl Iterator<Item = &Rect> {
        self.rects.values()
    }

    fn total_overlap(&self, candidate: &Rect) -> f64 {
        self.rects.values().map(|r| candidate.overlap_area(r)).sum()
    }

    fn is_free(&self, candidate: &Rect) -> bool {
        self.rects.values().all(|r| !candidate.overlaps(r))
    }

    /// Find a non-overlapping placement for `requested`.
    ///
    /// Searches outward on a fixed 28 px grid, ring by ring: cardinal
    /// offsets, diagonals, then ±2-step cardinals, 12 candidates per ring,
    /// up to 10 rings.  When no ring yields a clean spot, the candidate with
    /// the smallest total overlap area wins, ties broken by the smallest
    /// Manhattan offset from the requested anchor.
    pub fn place(&self, requested: Rect, viewport: (f64, f64)) -> Rect {
        if self.is_free(&requested) {
            return requested;
        }

        let mut best = requested;
        let mut best_overlap = self.total_overlap(&requested);
        let mut best_distance = 0.0f64;

        for ring in 1..=SEARCH_RINGS {
            let step = SEARCH_GRID * ring as f64;
            let double = step * 2.0;
            let candidates = [
                // Cardinal
                (0.0, -step),
                (0.0, step),
                (-step, 0.0),
                (step, 0.0),
                // Diagonal
                (-step, -step),
                (step, -step),
                (-step, step),
                (step, step),
                // ±2-step cardinal
                (0.0, -double),
                (0.0, double),
                (-double, 0.0),
                (double, 0.0),
            ];
            for (dx, dy) in candidates {
                let candidate = requested.offset(dx, dy).clamp_to(viewport);
                if self.is_free(&candidate) {
                    return candidate;
                }
                let overlap = self.total_overlap(&candidate);
                let distance = dx.abs() + dy.abs();
                if overlap < best_overlap
                    || (overlap == best_overlap && distance < best_distance)
                {
                    best = candidate;
                    best_overlap = overlap;
                    best_distance = distance;
                }
            }
        }
        best
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
