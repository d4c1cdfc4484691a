//! Server process lifecycle management.
//!
//! Spawns one tool server child process and starts the three background
//! tasks that keep it connected:
//! - stdout pump: bytes → `LineAssembler` → `dispatch_line`
//! - stderr pump: diagnostic lines → tracing at the inferred severity
//! - exit watcher: flips the liveness flag when the child exits

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{dispatch_line, LineAssembler, PendingRequests};
use super::types::ServerConfig;

/// Read size for the stdout pump.
const READ_CHUNK_BYTES: usize = 8 * 1024;

// ─── Diagnostics ─────────────────────────────────────────────────────────────

/// Severity inferred from a line of server stderr output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Infer the severity of a free-text diagnostic line.
///
/// The first recognised token wins (`level=warn`, `[ERROR]`, `DEBUG:` …).
/// Lines with no token are informational.
pub fn classify_diagnostic(line: &str) -> Severity {
    let lowered = line.to_ascii_lowercase();
    for token in lowered.split(|c: char| !c.is_ascii_alphanumeric()) {
        match token {
            "debug" | "trace" => return Severity::Debug,
            "info" => return Severity::Info,
            "warn" | "warning" => return Severity::Warn,
            "error" | "fatal" | "critical" | "panic" => return Severity::Error,
            _ => {}
        }
    }
    Severity::Info
}

fn log_diagnostic(server: &str, line: &str) {
    match classify_diagnostic(line) {
        Severity::Debug => tracing::debug!(server, "{line}"),
        Severity::Info => tracing::info!(server, "{line}"),
        Severity::Warn => tracing::warn!(server, "{line}"),
        Severity::Error => tracing::error!(server, "{line}"),
    }
}

// ─── ServerProcess ───────────────────────────────────────────────────────────

/// A running tool server process and its background tasks.
pub struct ServerProcess {
    name: String,
    alive: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Whether the child is still running (as last observed by the watcher).
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Kill the child and stop the pumps. Safe to call more than once.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
            tracing::info!(server = %self.name, "terminating server process");
        }
        self.alive.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            // The watcher must finish the kill itself; only the pumps are aborted.
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.kill_tx.is_some() {
            self.terminate();
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a server process and wire its stdio.
///
/// Returns the process handle and the child's stdin for the request channel.
/// Inbound responses are delivered straight into `pending`.
pub fn spawn_server(
    name: &str,
    config: &ServerConfig,
    pending: Arc<PendingRequests>,
) -> Result<(ServerProcess, ChildStdin), McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = child.stderr.take();

    tracing::info!(
        server = name,
        command = %config.command,
        pid = child.id().unwrap_or(0),
        "spawned server process"
    );

    let alive = Arc::new(AtomicBool::new(true));
    let (kill_tx, kill_rx) = oneshot::channel();

    let mut tasks = vec![tokio::spawn(pump_stdout(name.to_string(), stdout, pending))];
    if let Some(stderr) = stderr {
        tasks.push(tokio::spawn(pump_stderr(name.to_string(), stderr)));
    }
    // Not tracked in `tasks`: the watcher owns the child and must run to completion.
    tokio::spawn(watch_exit(name.to_string(), child, alive.clone(), kill_rx));

    Ok((
        ServerProcess {
            name: name.to_string(),
            alive,
            kill_tx: Some(kill_tx),
            tasks,
        },
        stdin,
    ))
}

async fn pump_stdout(server: String, mut stdout: ChildStdout, pending: Arc<PendingRequests>) {
    let mut assembler = LineAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in assembler.push(&buf[..n]) {
                    dispatch_line(&server, &pending, &line);
                }
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        }
    }

    if assembler.pending_bytes() > 0 {
        tracing::warn!(
            server = %server,
            bytes = assembler.pending_bytes(),
            "discarding unterminated trailing output"
        );
    }
    tracing::debug!(server = %server, "stdout closed");
}

async fn pump_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    log_diagnostic(&server, trimmed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

async fn watch_exit(
    server: String,
    mut child: Child,
    alive: Arc<AtomicBool>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            alive.store(false, Ordering::SeqCst);
            match status {
                Ok(status) => tracing::warn!(server = %server, %status, "server process exited"),
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "failed to wait on server process")
                }
            }
        }
        _ = kill_rx => {
            alive.store(false, Ordering::SeqCst);
            if let Err(e) = child.kill().await {
                tracing::debug!(
                    server = %server,
                    error = %e,
                    "kill failed (process may have exited)"
                );
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
