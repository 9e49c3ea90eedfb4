// Copyright (c) 2024-2026 CLOVIS Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Managed background processes.
//!
//! Server-like commands are promoted out of the CLI turn into detached
//! processes that survive it.  Each is launched in its own process group so
//! the whole tree can be signalled, logs to a file under the temp dir, and
//! is health-checked by polling its expected TCP ports.  A process-wide
//! table owns the records; an at-exit hook SIGTERMs every group.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How long a freshly promoted process gets to open one of its ports.
const PROMOTION_PORT_WAIT: Duration = Duration::from_secs(20);
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(600);
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(350);

/// One tracked background process.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub id: String,
    pub pid: u32,
    pub pgid: i32,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub ports: Vec<u16>,
    pub active_port: Option<u16>,
    pub health_warning: Option<String>,
    pub task: String,
}

impl ManagedProcess {
    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Process-wide table of managed background processes.
pub struct ProcessManager {
    table: Mutex<HashMap<String, ManagedProcess>>,
}

static GLOBAL: OnceLock<ProcessManager> = OnceLock::new();

#[cfg(unix)]
extern "C" fn sigterm_managed_groups_at_exit() {
    if let Some(manager) = GLOBAL.get() {
        manager.shutdown_sync();
    }
}

impl ProcessManager {
    /// The process-wide instance.  First access registers the at-exit
    /// teardown hook.
    pub fn global() -> &'static ProcessManager {
        GLOBAL.get_or_init(|| {
            #[cfg(unix)]
            unsafe {
                libc::atexit(sigterm_managed_groups_at_exit);
            }
            ProcessManager {
                table: Mutex::new(HashMap::new()),
            }
        })
    }

    #[cfg(test)]
    fn new_for_test() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Launch `command` detached under `/bin/zsh -lc` in its own process
    /// group, record it, and health-check any port mentioned in the task or
    /// command.  Returns the finished record and a one-line summary.
    pub async fn start(
        &self,
        command: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        task: &str,
    ) -> anyhow::Result<(ManagedProcess, String)> {
        let id = short_id();
        let log_path = std::env::temp_dir().join(format!("clovis_cli_bg_{id}.log"));
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening log file {}", log_path.display()))?;
        let log_err = log_file.try_clone().context("cloning log handle")?;

        let mut cmd = Command::new("/bin/zsh");
        cmd.arg("-lc")
            .arg(command)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err));
        // New session so the whole tree shares a signalable group and the
        // process survives the current turn.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning background command: {command}"))?;
        let pid = child.id().context("background process has no pid")?;
        let pgid = process_group_of(pid);

        let mut record = ManagedProcess {
            id: id.clone(),
            pid,
            pgid,
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            started_at: Utc::now(),
            log_path: log_path.clone(),
            ports: Vec::new(),
            active_port: None,
            health_warning: None,
            task: task.to_string(),
        };

        let ports = extract_port_candidates(&format!("{task}\n{command}"));
        if !ports.is_empty() {
            record.ports = ports.clone();
            match wait_for_any_port(&ports, PROMOTION_PORT_WAIT).await {
                Some(port) => record.active_port = Some(port),
                None => {
                    record.health_warning = Some(format!(
                        "Started process {pid}, but no expected port became reachable: {ports:?}"
                    ));
                }
            }
        }

        let mut summary_parts = vec![
            format!("Started background process {id}"),
            format!("(pid {pid})"),
            format!("command: {command}"),
            format!("log: {}", log_path.display()),
        ];
        if let Some(port) = record.active_port {
            summary_parts.push(format!("verified on http://127.0.0.1:{port}"));
        } else if !record.ports.is_empty() {
            summary_parts.push(format!("expected ports: {:?}", record.ports));
            summary_parts.push("health-check did not confirm readiness yet".into());
        }
        let summary = summary_parts.join(" | ");

        info!(id = %record.id, pid, pgid, "promoted background process");
        self.table
            .lock()
            .expect("process table poisoned")
            .insert(id, record.clone());
        Ok((record, summary))
    }

    /// SIGTERM one managed process group.  Returns `false` when unknown.
    pub fn stop(&self, id: &str) -> bool {
        let record = self.table.lock().expect("process table poisoned").remove(id);
        match record {
            Some(record) => {
                signal_group(&record);
                info!(id = %record.id, pid = record.pid, "stopped background process");
                true
            }
            None => false,
        }
    }

    /// SIGTERM every managed process group.  Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<ManagedProcess> = {
            let mut table = self.table.lock().expect("process table poisoned");
            table.drain().map(|(_, record)| record).collect()
        };
        for record in &drained {
            signal_group(record);
        }
        drained.len()
    }

    pub fn list(&self) -> Vec<ManagedProcess> {
        let mut rows: Vec<ManagedProcess> = self
            .table
            .lock()
            .expect("process table poisoned")
            .values()
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        rows
    }

    /// Synchronous best-effort teardown for the at-exit hook.
    pub fn shutdown_sync(&self) {
        if let Ok(mut table) = self.table.lock() {
            for (_, record) in table.drain() {
                signal_group(&record);
            }
        }
    }
}

fn signal_group(record: &ManagedProcess) {
    #[cfg(unix)]
    unsafe {
        if record.pgid > 0 {
            libc::killpg(record.pgid, libc::SIGTERM);
        } else if record.pid > 0 {
            libc::kill(record.pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = record;
}

fn process_group_of(pid: u32) -> i32 {
    #[cfg(unix)]
    unsafe {
        let pgid = libc::getpgid(pid as i32);
        if pgid > 0 {
            return pgid;
        }
    }
    pid as i32
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ─── Port helpers ─────────────────────────────────────────────────────────────

fn port_regexes() -> &'static [Regex; 3] {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            Regex::new(r"(?i)(?:localhost|127\.0\.0\.1)\s*:\s*(\d{2,5})").unwrap(),
            Regex::new(r"(?i)\bport\s+(\d{2,5})\b").unwrap(),
            Regex::new(r"(?i)--port(?:=|\s+)(\d{2,5})").unwrap(),
        ]
    })
}

/// Candidate TCP ports mentioned in free text: `localhost:N`, `port N`,
/// `--port N`.  Sorted, de-duplicated, limited to the valid range.
pub fn extract_port_candidates(text: &str) -> Vec<u16> {
    let mut ports = std::collections::BTreeSet::new();
    for re in port_regexes() {
        for cap in re.captures_iter(text) {
            if let Ok(port) = cap[1].parse::<u32>() {
                if (1..=65_535).contains(&port) {
                    ports.insert(port as u16);
                }
            }
        }
    }
    ports.into_iter().collect()
}

pub async fn is_local_port_open(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Poll until any candidate port accepts a TCP connection.
pub async fn wait_for_any_port(ports: &[u16], timeout: Duration) -> Option<u16> {
    if ports.is_empty() {
        return None;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for &port in ports {
            if is_local_port_open(port).await {
                debug!(port, "port became reachable");
                return Some(port);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(?ports, "no candidate port became reachable");
            return None;
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Port extraction ───────────────────────────────────────────────────────

    #[test]
    fn extracts_localhost_port_and_flag_forms() {
        let ports = extract_port_candidates(
            "serve on localhost:3000, or use --port 5173, maybe port 8080",
        );
        assert_eq!(ports, vec![3000, 5173, 8080]);
    }

    #[test]
    fn duplicate_ports_are_deduplicated() {
        let ports = extract_port_candidates("localhost:3000 and port 3000 and --port 3000");
        assert_eq!(ports, vec![3000]);
    }

    #[test]
    fn no_ports_in_plain_text() {
        assert!(extract_port_candidates("create a folder named hw").is_empty());
    }

    #[test]
    fn short_numbers_are_ignored() {
        // Single-digit captures do not match the 2-5 digit pattern.
        assert!(extract_port_candidates("port 7").is_empty());
    }

    // ── Port polling ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn wait_for_any_port_finds_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let found = wait_for_any_port(&[port], Duration::from_secs(2)).await;
        assert_eq!(found, Some(port));
    }

    #[tokio::test]
    async fn wait_for_any_port_times_out_quietly() {
        // Bind then drop so the port is very likely closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let found = wait_for_any_port(&[port], Duration::from_millis(200)).await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn empty_port_list_short_circuits() {
        assert_eq!(wait_for_any_port(&[], Duration::from_secs(5)).await, None);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    fn zsh_available() -> bool {
        std::path::Path::new("/bin/zsh").exists()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_records_pid_pgid_and_log() {
        if !zsh_available() {
            return;
        }
        let manager = ProcessManager::new_for_test();
        let cwd = std::env::temp_dir();
        let env = HashMap::new();
        let (record, summary) = manager
            .start("sleep 30", &cwd, &env, "run this in background")
            .await
            .unwrap();
        assert!(record.pid > 0);
        assert!(record.pgid > 0);
        assert!(record.log_path.exists());
        assert!(summary.contains("Started background process"));

        let rows = manager.list();
        assert_eq!(rows.len(), 1);
        assert!(manager.stop(&record.id));
        assert!(manager.list().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_all_drains_the_table() {
        if !zsh_available() {
            return;
        }
        let manager = ProcessManager::new_for_test();
        let cwd = std::env::temp_dir();
        let env = HashMap::new();
        manager.start("sleep 30", &cwd, &env, "bg one").await.unwrap();
        manager.start("sleep 30", &cwd, &env, "bg two").await.unwrap();
        assert_eq!(manager.stop_all(), 2);
        assert!(manager.list().is_empty());
    }

    #[test]
    fn stop_unknown_id_is_false() {
        let manager = ProcessManager::new_for_test();
        assert!(!manager.stop("nope1234"));
    }
}
