// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::Parser;

/// CLOVIS, the overlay-driven multi-agent orchestrator for computer use.
#[derive(Debug, Parser)]
#[command(name = "clovis", version, about)]
pub struct Cli {
    /// Path to settings.json (defaults to ./settings.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the configured overlay host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the configured overlay port
    #[arg(long)]
    pub port: Option<u16>,

    /// Verbose logging to stderr (equivalent to CLOVIS_LOG=debug)
    #[arg(short, long)]
    pub verbose: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
