// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: MIT
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info};

use crate::Settings;

/// Default settings.json location: next to the binary's working directory,
/// overridable with `--config` on the CLI.
pub fn default_settings_path() -> PathBuf {
    PathBuf::from("settings.json")
}

/// Load settings from `path`, or defaults when the file does not exist.
/// A present-but-unparseable file is an error: silently replacing a corrupt
/// settings file would also discard the renderer's private keys.
pub fn load(path: Option<&Path>) -> anyhow::Result<Settings> {
    let path = expand(path);
    if !path.is_file() {
        debug!(path = %path.display(), "settings file absent, using defaults");
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let settings: Settings =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(settings)
}

/// Persist settings back to disk (pretty-printed, matching the renderer).
pub fn save(settings: &Settings, path: Option<&Path>) -> anyhow::Result<()> {
    let path = expand(path);
    let text = serde_json::to_string_pretty(settings).context("serializing settings")?;
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn expand(path: Option<&Path>) -> PathBuf {
    match path {
        Some(p) => {
            let s = p.to_string_lossy();
            PathBuf::from(shellexpand::tilde(s.as_ref()).into_owned())
        }
        None => default_settings_path(),
    }
}

/// Return the configured port if it is free, otherwise bind port 0 and let
/// the OS hand out an ephemeral one.  Callers persist the chosen value so
/// the overlay renderer reads the same port from settings.json.
pub fn pick_listen_port(host: &str, configured: u16) -> anyhow::Result<u16> {
    if TcpListener::bind((host, configured)).is_ok() {
        return Ok(configured);
    }
    let listener = TcpListener::bind((host, 0))
        .with_context(|| format!("no free port on {host}"))?;
    let port = listener.local_addr().context("reading ephemeral port")?.port();
    info!(configured, chosen = port, "configured port taken, using ephemeral port");
    Ok(port)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let s = load(Some(&path)).unwrap();
        assert_eq!(s.port, 8765);
    }

    #[test]
    fn load_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut s = Settings::default();
        s.port = 4242;
        s.personalization = Some("terse".into());
        save(&s, Some(&path)).unwrap();
        let back = load(Some(&path)).unwrap();
        assert_eq!(back.port, 4242);
        assert_eq!(back.personalization.as_deref(), Some("terse"));
    }

    #[test]
    fn pick_listen_port_keeps_free_port() {
        // An ephemeral port we just released is overwhelmingly likely free.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert_eq!(pick_listen_port("127.0.0.1", port).unwrap(), port);
    }

    #[test]
    fn pick_listen_port_moves_off_taken_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();
        let chosen = pick_listen_port("127.0.0.1", taken).unwrap();
        assert_ne!(chosen, taken);
        assert!(chosen > 0);
    }
}
