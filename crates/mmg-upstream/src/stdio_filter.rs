//! Stdio adapter for upstreams that intermix human log lines with JSON-RPC
//! frames on stdout.
//!
//! The child's stdout is split into lines; only well-formed JSON-RPC frames
//! are forwarded to the MCP client through an in-process duplex pipe. Every
//! other line is routed to the logger at an inferred level. Stderr is always
//! logged at warn.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

use crate::client::CrashInfo;

const FRAME_PIPE_CAPACITY: usize = 64 * 1024;
const STDOUT_CHUNK_SIZE: usize = 8 * 1024;

/// A spawned child whose stdout has been reduced to clean JSON-RPC frames.
pub(crate) struct FilteredStdioProcess {
    /// Read side of the frame pipe; hand to the MCP client together with
    /// `stdin`.
    pub(crate) frames: DuplexStream,
    pub(crate) stdin: ChildStdin,
    pub(crate) controller: ProcessController,
}

/// Owns the child handle for shutdown and exit observation.
pub(crate) struct ProcessController {
    child: Arc<Mutex<Child>>,
    pid: Option<u32>,
    closing: Arc<AtomicBool>,
    grace: Duration,
}

pub(crate) async fn spawn_filtered(
    server_name: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    cwd: Option<&Path>,
    grace: Duration,
    crash_tx: mpsc::UnboundedSender<CrashInfo>,
) -> Result<FilteredStdioProcess> {
    let mut cmd = Command::new(command);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: setsid() is async-signal-safe and runs before exec; it isolates
    // the child in its own process group so shutdown signals reach the whole
    // tree.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn MCP server '{server_name}'"))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdout for MCP server '{server_name}'"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdin for MCP server '{server_name}'"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("failed to capture stderr for MCP server '{server_name}'"))?;

    let closing = Arc::new(AtomicBool::new(false));
    let child = Arc::new(Mutex::new(child));

    {
        let server = server_name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::warn!(server = %server, "{}", line.trim_end());
                }
            }
        });
    }

    let (frames, frame_writer) = tokio::io::duplex(FRAME_PIPE_CAPACITY);
    {
        let server = server_name.to_string();
        let child = child.clone();
        let closing = closing.clone();
        tokio::spawn(async move {
            pump_stdout(stdout, frame_writer, &server).await;
            if closing.load(Ordering::SeqCst) {
                return;
            }
            let status = child.lock().await.wait().await;
            let info = match status {
                Ok(status) => CrashInfo::from_status(status),
                Err(error) => {
                    tracing::debug!(server = %server, error = %error, "failed to reap MCP child");
                    CrashInfo::default()
                }
            };
            tracing::warn!(
                server = %server,
                exit_code = ?info.exit_code,
                signal = ?info.signal,
                "MCP server process exited"
            );
            let _ = crash_tx.send(info);
        });
    }

    Ok(FilteredStdioProcess {
        frames,
        stdin,
        controller: ProcessController {
            child,
            pid,
            closing,
            grace,
        },
    })
}

async fn pump_stdout(
    stdout: tokio::process::ChildStdout,
    mut frame_writer: DuplexStream,
    server: &str,
) {
    use tokio::io::AsyncReadExt;

    let mut stdout = stdout;
    let mut assembler = LineAssembler::default();
    let mut chunk = vec![0u8; STDOUT_CHUNK_SIZE];

    loop {
        let read = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                tracing::debug!(server = %server, error = %error, "stdout read failed");
                break;
            }
        };

        for line in assembler.push(&chunk[..read]) {
            if line.trim().is_empty() {
                continue;
            }
            if is_jsonrpc_frame(&line) {
                if frame_writer.write_all(line.as_bytes()).await.is_err()
                    || frame_writer.write_all(b"\n").await.is_err()
                {
                    return;
                }
            } else {
                log_contaminated_line(server, &line);
            }
        }
    }

    let _ = frame_writer.shutdown().await;
}

impl ProcessController {
    /// Marks the process as intentionally closing so the exit watcher does
    /// not report a crash. Must run before the MCP service is cancelled,
    /// since closing stdin alone makes most children exit.
    pub(crate) fn begin_shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Graceful stop: SIGTERM the process group, escalate to SIGKILL after
    /// the grace period.
    pub(crate) async fn shutdown(&self) {
        self.begin_shutdown();
        self.signal_group(libc::SIGTERM);

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(_)) | Ok(Err(_)) => {}
            Err(_) => {
                self.signal_group(libc::SIGKILL);
                let _ = child.wait().await;
            }
        }
    }

    fn signal_group(&self, signal: i32) {
        if let Some(pid) = self.pid {
            // SAFETY: kill() is async-signal-safe; the negative PID targets
            // the process group created by setsid.
            #[cfg(unix)]
            unsafe {
                libc::kill(-(pid as i32), signal);
            }
        }
    }
}

/// Accumulates stdout chunks and yields complete lines; the trailing
/// fragment is retained until its newline arrives.
#[derive(Default)]
struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// A line is a JSON-RPC frame iff it parses as an object with
/// `jsonrpc == "2.0"` and carries a method, or a result/error with an id.
fn is_jsonrpc_frame(line: &str) -> bool {
    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
        return false;
    };
    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return false;
    }
    obj.contains_key("method")
        || (obj.contains_key("id")
            && (obj.contains_key("result") || obj.contains_key("error")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdoutLevel {
    Debug,
    Info,
    Warning,
    Error,
}

fn infer_stdout_level(line: &str) -> StdoutLevel {
    static PATTERNS: std::sync::LazyLock<[Regex; 3]> = std::sync::LazyLock::new(|| {
        [
            Regex::new(r"(?i)^(DEBUG|INFO|WARNING|ERROR|CRITICAL)\s+").unwrap(),
            Regex::new(r"(?i)^\[(DEBUG|INFO|WARNING|ERROR|CRITICAL)\]").unwrap(),
            Regex::new(r"(?i)\s(DEBUG|INFO|WARNING|ERROR|CRITICAL)\s").unwrap(),
        ]
    });

    for pattern in PATTERNS.iter() {
        if let Some(captures) = pattern.captures(line) {
            let level = captures.get(1).map(|m| m.as_str().to_ascii_uppercase());
            return match level.as_deref() {
                Some("DEBUG") => StdoutLevel::Debug,
                Some("WARNING") => StdoutLevel::Warning,
                Some("ERROR") | Some("CRITICAL") => StdoutLevel::Error,
                _ => StdoutLevel::Info,
            };
        }
    }
    StdoutLevel::Info
}

fn log_contaminated_line(server: &str, line: &str) {
    match infer_stdout_level(line) {
        StdoutLevel::Debug => tracing::debug!(server = %server, "{line}"),
        StdoutLevel::Info => tracing::info!(server = %server, "{line}"),
        StdoutLevel::Warning => tracing::warn!(server = %server, "{line}"),
        StdoutLevel::Error => tracing::error!(server = %server, "{line}"),
    }
}
