// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Auto-contrast theming.
//!
//! The renderer never infers theme: the server samples the cached
//! screenshot under a point and injects the chosen palette into draw and
//! status payloads before broadcast.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Generic draw threshold.
const DARK_LUMINANCE_THRESHOLD: f64 = 112.0;
/// Inverted-panel threshold used for text labels and cursor pills.
const INVERTED_PANEL_DARK_THRESHOLD: f64 = 45.0;
/// More lenient inverted threshold for the brighter top strip behind the
/// status bubble.
const STATUS_INVERTED_PANEL_DARK_THRESHOLD: f64 = 132.0;

/// A full renderer palette.  Field names match the renderer's theme object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub mode: String,
    pub accent: String,
    pub box_stroke: String,
    pub text: String,
    pub label: String,
    pub thinking: String,
    pub panel_bg: String,
    pub panel_border: String,
    pub meta: String,
    pub divider: String,
    pub shimmer: String,
    pub status_bg: String,
    pub status_border: String,
    pub status_text: String,
    pub status_shimmer: String,
    pub status_check: String,
    pub cursor_bg: String,
    pub cursor_border: String,
    pub cursor_text: String,
    pub cursor_shimmer: String,
}

impl Theme {
    /// Warm accents, light text, translucent dark panel.
    pub fn light_on_dark() -> Self {
        Self {
            mode: "light-on-dark".into(),
            accent: "rgba(160, 200, 255, 0.85)".into(),
            box_stroke: "rgba(102, 183, 255, 0.95)".into(),
            text: "rgba(242, 245, 248, 0.96)".into(),
            label: "rgba(255, 255, 255, 0.5)".into(),
            thinking: "rgba(210, 215, 224, 0.85)".into(),
            panel_bg: "rgba(14, 14, 18, 0.9)".into(),
            panel_border: "rgba(255, 255, 255, 0.12)".into(),
            meta: "rgba(255, 255, 255, 0.7)".into(),
            divider: "rgba(255, 255, 255, 0.75)".into(),
            shimmer: "rgba(255, 255, 255, 1)".into(),
            status_bg: "rgba(4, 5, 7, 0.96)".into(),
            status_border: "rgba(255, 255, 255, 0.06)".into(),
            status_text: "rgba(242, 245, 248, 0.96)".into(),
            status_shimmer: "rgba(160, 200, 255, 0.6)".into(),
            status_check: "rgba(130, 200, 130, 0.9)".into(),
            cursor_bg: "rgba(5, 6, 8, 0.92)".into(),
            cursor_border: "rgba(255, 255, 255, 0.06)".into(),
            cursor_text: "rgba(242, 245, 248, 0.96)".into(),
            cursor_shimmer: "rgba(160, 200, 255, 0.6)".into(),
        }
    }

    /// Saturated blue accents, dark text, translucent light panel.
    pub fn dark_on_light() -> Self {
        Self {
            mode: "dark-on-light".into(),
            accent: "rgba(55, 120, 220, 0.85)".into(),
            box_stroke: "rgba(45, 123, 255, 0.95)".into(),
            text: "rgba(15, 20, 30, 0.94)".into(),
            label: "rgba(15, 20, 30, 0.55)".into(),
            thinking: "rgba(35, 40, 55, 0.75)".into(),
            panel_bg: "rgba(248, 250, 252, 0.94)".into(),
            panel_border: "rgba(15, 20, 30, 0.14)".into(),
            meta: "rgba(15, 20, 30, 0.6)".into(),
            divider: "rgba(15, 20, 30, 0.5)".into(),
            shimmer: "rgba(60, 120, 220, 0.85)".into(),
            status_bg: "rgba(245, 248, 252, 0.96)".into(),
            status_border: "rgba(15, 20, 30, 0.1)".into(),
            status_text: "rgba(15, 20, 30, 0.94)".into(),
            status_shimmer: "rgba(60, 120, 220, 0.55)".into(),
            status_check: "rgba(60, 120, 220, 0.9)".into(),
            cursor_bg: "rgba(246, 249, 252, 0.94)".into(),
            cursor_border: "rgba(15, 20, 30, 0.1)".into(),
            cursor_text: "rgba(15, 20, 30, 0.94)".into(),
            cursor_shimmer: "rgba(60, 120, 220, 0.55)".into(),
        }
    }

    fn for_dark_background(dark: bool) -> Self {
        if dark {
            Self::light_on_dark()
        } else {
            Self::dark_on_light()
        }
    }
}

/// Samples screen luminance under a point to pick a palette.
///
/// Holds the latest screenshot frame; when no frame is available, or the
/// frame looks like a failed capture, the sampler sticks with its last
/// decision rather than flickering between palettes.
pub struct ThemeSampler {
    screenshot: Option<RgbImage>,
    last_dark: bool,
    cursor_pos: (f64, f64),
}

impl Default for ThemeSampler {
    fn default() -> Self {
        Self {
            screenshot: None,
            last_dark: false,
            cursor_pos: (0.0, 0.0),
        }
    }
}

impl ThemeSampler {
    pub fn store_screenshot(&mut self, image: RgbImage) {
        self.screenshot = Some(image);
    }

    pub fn set_cursor_pos(&mut self, x: f64, y: f64) {
        self.cursor_pos = (x, y);
    }

    pub fn has_screenshot(&self) -> bool {
        self.screenshot.is_some()
    }

    pub fn screenshot(&self) -> Option<&RgbImage> {
        self.screenshot.as_ref()
    }

    /// Sparse sampling: when ≥90% of probed pixels are near-black, this is
    /// likely a bad capture path and the frame must not drive theming.
    fn is_likely_invalid(image: &RgbImage) -> bool {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return true;
        }
        let step_x = (width / 6).max(1);
        let step_y = (height / 6).max(1);
        let mut dark_like = 0u32;
        let mut total = 0u32;
        let mut y = 0;
        while y < height {
            let mut x = 0;
            while x < width {
                let p = image.get_pixel(x, y);
                total += 1;
                if p[0] <= 4 && p[1] <= 4 && p[2] <= 4 {
                    dark_like += 1;
                }
                x += step_x;
            }
            y += step_y;
        }
        total == 0 || (dark_like as f64 / total as f64) >= 0.9
    }

    /// Mean Rec.709 luminance of a 12 px neighborhood sampled at 4 px steps,
    /// compared against `threshold`.  Falls back to the last decision when
    /// no usable frame exists.
    fn is_dark_at(&mut self, x: f64, y: f64, threshold: f64) -> bool {
        let image = match &self.screenshot {
            Some(img) if !Self::is_likely_invalid(img) => img,
            _ => return self.last_dark,
        };
        let (width, height) = image.dimensions();
        let px = (x as i64).clamp(0, width as i64 - 1);
        let py = (y as i64).clamp(0, height as i64 - 1);

        const RADIUS: i64 = 12;
        const STEP: i64 = 4;
        let mut luminance_sum = 0.0f64;
        let mut samples = 0u32;

        let mut dy = -RADIUS;
        while dy <= RADIUS {
            let sy = (py + dy).clamp(0, height as i64 - 1) as u32;
            let mut dx = -RADIUS;
            while dx <= RADIUS {
                let sx = (px + dx).clamp(0, width as i64 - 1) as u32;
                let p = image.get_pixel(sx, sy);
                luminance_sum +=
                    0.2126 * p[0] as f64 + 0.7152 * p[1] as f64 + 0.0722 * p[2] as f64;
                samples += 1;
                dx += STEP;
            }
            dy += STEP;
        }

        if samples == 0 {
            return self.last_dark;
        }
        let dark = (luminance_sum / samples as f64) < threshold;
        self.last_dark = dark;
        dark
    }

    /// Palette for a generic draw at a point (boxes).
    pub fn theme_for_point(&mut self, x: f64, y: f64) -> Theme {
        let dark = self.is_dark_at(x, y, DARK_LUMINANCE_THRESHOLD);
        Theme::for_dark_background(dark)
    }

    /// Palette for a text panel.  Inverted so the panel contrasts with the
    /// background it floats over.
    pub fn theme_for_text(&mut self, x: f64, y: f64) -> Theme {
        let dark = self.is_dark_at(x, y, INVERTED_PANEL_DARK_THRESHOLD);
        Theme::for_dark_background(!dark)
    }

    /// Palette for the top status bubble, sampled mid-screen in the top
    /// strip, inverted with the lenient threshold.
    pub fn theme_for_status(&mut self, screen_size: (u32, u32)) -> Theme {
        let (mut width, _height) = screen_size;
        if width == 0 {
            if let Some(img) = &self.screenshot {
                width = img.width();
            }
        }
        let x = (width.max(1) as f64) / 2.0;
        let dark = self.is_dark_at(x, 50.0, STATUS_INVERTED_PANEL_DARK_THRESHOLD);
        Theme::for_dark_background(!dark)
    }

    /// Palette for the cursor pill at the last reported cursor position.
    pub fn theme_for_cursor(&mut self) -> Theme {
        let (x, y) = self.cursor_pos;
        let dark = self.is_dark_at(x, y, INVERTED_PANEL_DARK_THRESHOLD);
        Theme::for_dark_background(!dark)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_image(w: u32, h: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb(rgb))
    }

    #[test]
    fn dark_point_selects_light_on_dark() {
        let mut s = ThemeSampler::default();
        s.store_screenshot(flat_image(200, 200, [20, 20, 20]));
        let theme = s.theme_for_point(100.0, 100.0);
        assert_eq!(theme.mode, "light-on-dark");
    }

    #[test]
    fn bright_point_selects_dark_on_light() {
        let mut s = ThemeSampler::default();
        s.store_screenshot(flat_image(200, 200, [240, 240, 240]));
        let theme = s.theme_for_point(100.0, 100.0);
        assert_eq!(theme.mode, "dark-on-light");
    }

    #[test]
    fn threshold_is_stable_against_one_unit_perturbation() {
        // Gray levels straddling the 112 threshold on both sides.
        for level in [110u8, 111] {
            let mut s = ThemeSampler::default();
            s.store_screenshot(flat_image(64, 64, [level, level, level]));
            assert_eq!(s.theme_for_point(32.0, 32.0).mode, "light-on-dark");
        }
        for level in [113u8, 114] {
            let mut s = ThemeSampler::default();
            s.store_screenshot(flat_image(64, 64, [level, level, level]));
            assert_eq!(s.theme_for_point(32.0, 32.0).mode, "dark-on-light");
        }
    }

    #[test]
    fn text_theme_is_inverted() {
        let mut s = ThemeSampler::default();
        // Bright background: the raw sample is "not dark", text panel inverts
        // to light-on-dark so the panel stands out against the bright area.
        s.store_screenshot(flat_image(200, 200, [240, 240, 240]));
        assert_eq!(s.theme_for_text(100.0, 100.0).mode, "light-on-dark");
    }

    #[test]
    fn missing_screenshot_retains_last_decision() {
        let mut s = ThemeSampler::default();
        s.store_screenshot(flat_image(64, 64, [10, 10, 10]));
        assert_eq!(s.theme_for_point(32.0, 32.0).mode, "light-on-dark");
        // Drop to an all-black (likely invalid) capture: decision sticks.
        s.store_screenshot(flat_image(64, 64, [0, 0, 0]));
        assert_eq!(s.theme_for_point(32.0, 32.0).mode, "light-on-dark");
    }

    #[test]
    fn near_black_capture_is_invalid() {
        assert!(ThemeSampler::is_likely_invalid(&flat_image(64, 64, [1, 1, 1])));
        assert!(!ThemeSampler::is_likely_invalid(&flat_image(64, 64, [90, 90, 90])));
    }

    #[test]
    fn out_of_bounds_point_is_clamped() {
        let mut s = ThemeSampler::default();
        s.store_screenshot(flat_image(64, 64, [10, 10, 10]));
        // Should not panic, and should still sample the dark frame.
        assert_eq!(s.theme_for_point(10_000.0, -50.0).mode, "light-on-dark");
    }

    #[test]
    fn status_theme_uses_lenient_threshold() {
        let mut s = ThemeSampler::default();
        // Luminance 120: dark for the 132 status threshold, bright for the
        // generic 112 threshold.
        s.store_screenshot(flat_image(400, 200, [120, 120, 120]));
        let status = s.theme_for_status((400, 200));
        // dark under 132 → inverted → dark-on-light
        assert_eq!(status.mode, "dark-on-light");
        let generic = s.theme_for_point(200.0, 50.0);
        assert_eq!(generic.mode, "dark-on-light");
    }

    #[test]
    fn cursor_theme_follows_reported_position() {
        let mut s = ThemeSampler::default();
        let mut img = flat_image(200, 100, [240, 240, 240]);
        // Dark left half.
        for y in 0..100 {
            for x in 0..80 {
                img.put_pixel(x, y, image::Rgb([5, 5, 5]));
            }
        }
        s.store_screenshot(img);
        s.set_cursor_pos(40.0, 50.0);
        // Dark under cursor (below 45 threshold) → inverted → dark-on-light.
        assert_eq!(s.theme_for_cursor().mode, "dark-on-light");
        s.set_cursor_pos(160.0, 50.0);
        assert_eq!(s.theme_for_cursor().mode, "light-on-dark");
    }
}
