// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

/// Total entries retained.
const CAPACITY: usize = 32;
/// Entries rendered into the router prompt.
const PROMPT_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub role: MemoryRole,
    /// Producing agent tag ("rapid", "cua_cli", …).
    pub source: String,
    pub text: String,
}

/// Bounded ring of summarized conversation turns.  Appended after each user
/// turn and each chain-step message; the router prompt reads at most the
/// last twenty entries.
#[derive(Debug, Default)]
pub struct ConversationMemory {
    entries: VecDeque<MemoryEntry>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(MemoryEntry {
            role: MemoryRole::User,
            source: "user".into(),
            text: text.into(),
        });
    }

    pub fn push_assistant(&mut self, source: impl Into<String>, text: impl Into<String>) {
        self.push(MemoryEntry {
            role: MemoryRole::Assistant,
            source: source.into(),
            text: text.into(),
        });
    }

    fn push(&mut self, entry: MemoryEntry) {
        if self.entries.len() == CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    /// The prompt transcript: last ≤20 entries, one line each.
    pub fn transcript(&self) -> String {
        let skip = self.entries.len().saturating_sub(PROMPT_WINDOW);
        self.entries
            .iter()
            .skip(skip)
            .map(|e| match e.role {
                MemoryRole::User => format!("User: {}", e.text),
                MemoryRole::Assistant => format!("Assistant [{}]: {}", e.source, e.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_at_capacity() {
        let mut m = ConversationMemory::new();
        for i in 0..40 {
            m.push_user(format!("msg {i}"));
        }
        assert_eq!(m.len(), CAPACITY);
        // Oldest entries evicted first.
        assert_eq!(m.entries().next().unwrap().text, "msg 8");
    }

    #[test]
    fn transcript_is_limited_to_prompt_window() {
        let mut m = ConversationMemory::new();
        for i in 0..30 {
            m.push_user(format!("msg {i}"));
        }
        let transcript = m.transcript();
        assert_eq!(transcript.lines().count(), PROMPT_WINDOW);
        assert!(transcript.lines().next().unwrap().contains("msg 10"));
        assert!(transcript.lines().last().unwrap().contains("msg 29"));
    }

    #[test]
    fn transcript_renders_roles_and_sources() {
        let mut m = ConversationMemory::new();
        m.push_user("clone this repo");
        m.push_assistant("cua_cli", "cloned to ~/demo");
        let transcript = m.transcript();
        assert_eq!(
            transcript,
            "User: clone this repo\nAssistant [cua_cli]: cloned to ~/demo"
        );
    }

    #[test]
    fn empty_memory_renders_empty_transcript() {
        let m = ConversationMemory::new();
        assert!(m.transcript().is_empty());
        assert!(m.is_empty());
    }
}
