// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Overlay transport and drawing pipeline.
//!
//! The overlay renderer is an external process on the far side of a
//! WebSocket; this crate owns everything up to that boundary: the command
//! vocabulary, the entity registry with snapshot replay, auto-contrast
//! theming, and the time-ordered draw action queue with its text
//! non-overlap layout.

mod commands;
mod layout;
mod queue;
mod server;
mod theme;

pub use commands::{CommandSink, InboundEvent, OverlayCommand};
pub use layout::{normalize_to_pixels, Align, Baseline, LayoutCache, Rect, TextAnchor};
pub use queue::{DrawAction, DrawQueue};
pub use server::{OverlayEvent, OverlayHandle, OverlayServer};
pub use theme::{Theme, ThemeSampler};
