// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Router prompt assembly.

use crate::judge::ScreenContext;
use crate::session::ChainStep;

/// Static system text for the rapid response model, with the optional
/// personalization section from settings.
pub(crate) fn router_system_prompt(personalization: Option<&str>) -> String {
    let personality = match personalization.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => format!("\nPersonality Description: {p}\n"),
        None => String::new(),
    };
    format!(
        "You are CLOVIS, a next generation computer use agent. You are the router/dispatcher \
         that decides how to handle user requests.\n\
         {personality}\n\
         You have six tools available:\n\n\
         1. **direct_response** - Answer simple questions immediately (math, facts, greetings)\n\
         2. **invoke_clovis** - Annotate/explain things on the user's screen (\"what's this \
         button?\", anything referring to visible UI)\n\
         3. **invoke_browser** - Web automation tasks (search, forms, navigation)\n\
         4. **invoke_cua_cli** - Shell-based desktop control (commands, files, servers)\n\
         5. **invoke_cua_vision** - GUI-based desktop control (clicking, typing in apps)\n\
         6. **request_screen_context** - One-shot screenshot context extraction for routing \
         (use when the user refers to visible context like \"this repo\" or \"on my screen\")\n\n\
         ROUTING RULES:\n\
         - HARD RULE: `invoke_clovis` is for explanation/annotation only, not execution.\n\
         - If the user asks you to DO something (clone/run/open/click/type/install/start), \
         never choose `invoke_clovis`.\n\
         - For executable desktop workflows, choose one of: `invoke_cua_vision`, \
         `invoke_cua_cli`, `invoke_browser`.\n\
         - If execution depends on currently visible context, call `request_screen_context` \
         first, then continue execution.\n\
         - Use `invoke_browser` for browser/web tasks.\n\
         - Use `invoke_cua_cli` for shell/file/localhost/server tasks.\n\
         - Use `invoke_cua_vision` for UI clicking/typing/navigation tasks on desktop apps.\n\
         - Only use `direct_response` for simple answers OR when a multi-step execution is \
         fully complete.\n\
         - For multi-step requests, choose one actionable tool call per turn and continue \
         step-by-step until done.\n\
         - IMPORTANT: When passing tasks to agents, preserve the user's original wording and \
         context faithfully. Do NOT paraphrase, simplify, or strip away site names, URLs, or \
         contextual details."
    )
}

/// The chain-state block: prior steps plus the latest screen context.
pub(crate) fn render_chain_state(steps: &[ChainStep], context: Option<&ScreenContext>) -> String {
    let mut out = String::new();
    if !steps.is_empty() {
        out.push_str("Chain state (steps already executed this request):\n");
        for (i, step) in steps.iter().enumerate() {
            let status = if step.success { "ok" } else { "FAILED" };
            out.push_str(&format!(
                "{}. [{}] {} -> {}: {}\n",
                i + 1,
                status,
                step.agent,
                step.task,
                step.message
            ));
        }
    }
    if let Some(ctx) = context {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("Latest screen context:\n");
        out.push_str(&ctx.render_for_prompt());
        out.push('\n');
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
