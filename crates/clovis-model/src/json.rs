// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Parse near-JSON model output.
///
/// Policy: try a full parse first; on failure, extract the substring from
/// the first `{` to the last `}` and parse that.  Models routinely wrap
/// JSON replies in prose or markdown fences, and this two-step recovery is
/// sufficient; there is deliberately no third strategy.
pub fn parse_loose_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
