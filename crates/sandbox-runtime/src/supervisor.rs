//! Sandbox process supervision
//!
//! Spawns the container tool, relays its output and terminates it. Output is
//! captured from stdout and stderr by one reader task each; both feed a
//! bounded channel drained by a single sink task, which is what turns the two
//! pipes into one combined stream. The sink logs every line at `debug` and
//! appends it to the session log file when one is configured.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::command::InvocationCommand;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::Result;

/// Lines buffered between the pipe readers and the sink.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on waiting for the relay after the process is gone.
pub const RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Reader and sink tasks for one process.
#[derive(Debug)]
pub struct LogRelay {
    readers: Vec<JoinHandle<()>>,
    sink: JoinHandle<()>,
}

impl LogRelay {
    fn start<O, E>(stdout: Option<O>, stderr: Option<E>, log_file: Option<File>) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let span = tracing::Span::current();

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = stdout {
            readers.push(tokio::spawn(read_lines(out, tx.clone()).instrument(span.clone())));
        }
        if let Some(err) = stderr {
            readers.push(tokio::spawn(read_lines(err, tx.clone()).instrument(span.clone())));
        }
        drop(tx);

        let sink = tokio::spawn(sink_lines(rx, log_file).instrument(span));
        LogRelay { readers, sink }
    }

    /// Wait for the relay to drain; abort whatever is still running after
    /// `timeout`, which also closes the captured pipes.
    pub async fn join(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for mut reader in self.readers {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                debug!("Log reader still running after {:?}; aborting", timeout);
                reader.abort();
            }
        }

        let mut sink = self.sink;
        if tokio::time::timeout_at(deadline, &mut sink).await.is_err() {
            debug!("Log sink still running after {:?}; aborting", timeout);
            sink.abort();
        }
    }
}

/// Forward each output line to the sink until end of stream.
///
/// Bytes are decoded lossily and the pipe is drained even once the sink is
/// gone, so the sandbox never sees a closed pipe while it is still writing.
async fn read_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading sandbox output");
                break;
            }
        }
    }
}

async fn sink_lines(mut rx: mpsc::Receiver<String>, mut log_file: Option<File>) {
    let mut write_failed = false;
    while let Some(line) = rx.recv().await {
        debug!("[apptainer] {}", line.trim_end());

        let Some(file) = log_file.as_mut() else {
            continue;
        };
        let mut record = line.into_bytes();
        record.push(b'\n');
        let written = match file.write_all(&record).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if !write_failed {
                warn!(error = %e, "Failed to write sandbox log file; continuing without it");
            }
            write_failed = true;
        }
    }
}

/// A running (or exited) sandbox process owned by one runtime instance.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    relay: Option<LogRelay>,
    exit_status: Option<ExitStatus>,
}

impl SupervisedProcess {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has terminated, without blocking.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait()?;
        }
        Ok(self.exit_status)
    }

    /// `true` while the process has not exited. Errors count as exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_exit_status(), Ok(None))
    }
}

/// Starts and stops sandbox processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    graceful_timeout: Duration,
    kill_timeout: Duration,
    relay_join_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(5))
    }
}

impl ProcessSupervisor {
    pub fn new(graceful_timeout: Duration, kill_timeout: Duration) -> Self {
        ProcessSupervisor {
            graceful_timeout,
            kill_timeout,
            relay_join_timeout: RELAY_JOIN_TIMEOUT,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.graceful_timeout(), config.kill_timeout())
    }

    /// Spawn `command` and start relaying its output.
    ///
    /// A log file that cannot be opened is reported and skipped; the process
    /// is started regardless.
    pub async fn start(
        &self,
        command: &InvocationCommand,
        log_file: Option<&Path>,
    ) -> Result<SupervisedProcess> {
        let file = match log_file {
            Some(path) => open_log_file(path).await,
            None => None,
        };

        let mut child = Command::new(command.program())
            .args(command.args())
            .env_clear()
            .envs(command.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: command.program().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(pid, program = command.program(), "Started sandbox process");

        let relay = LogRelay::start(child.stdout.take(), child.stderr.take(), file);
        Ok(SupervisedProcess {
            child,
            pid,
            relay: Some(relay),
            exit_status: None,
        })
    }

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Always joins the log relay. Never fails; an already-exited process is
    /// simply reaped.
    pub async fn stop(&self, mut process: SupervisedProcess) -> Option<ExitStatus> {
        let status = match process.try_exit_status() {
            Ok(Some(status)) => {
                debug!(pid = process.pid, %status, "Sandbox process already exited");
                Some(status)
            }
            _ => self.terminate(&mut process).await,
        };

        if let Some(relay) = process.relay.take() {
            relay.join(self.relay_join_timeout).await;
        }
        status
    }

    async fn terminate(&self, process: &mut SupervisedProcess) -> Option<ExitStatus> {
        request_graceful_exit(&mut process.child, process.pid);

        match tokio::time::timeout(self.graceful_timeout, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = process.pid, %status, "Sandbox process terminated");
                return Some(status);
            }
            Ok(Err(e)) => {
                warn!(pid = process.pid, error = %e, "Failed to wait for sandbox process");
            }
            Err(_) => {
                warn!(
                    pid = process.pid,
                    "Sandbox process ignored SIGTERM for {:?}; killing", self.graceful_timeout
                );
            }
        }

        if let Err(e) = process.child.start_kill() {
            debug!(pid = process.pid, error = %e, "Kill failed; process likely gone");
        }
        match tokio::time::timeout(self.kill_timeout, process.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(pid = process.pid, error = %e, "Failed to reap killed sandbox process");
                None
            }
            Err(_) => {
                warn!(pid = process.pid, "Sandbox process still alive {:?} after SIGKILL", self.kill_timeout);
                None
            }
        }
    }
}

#[cfg(unix)]
fn request_graceful_exit(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        let _ = child.start_kill();
        return;
    };
    if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %errno, "SIGTERM not delivered");
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

async fn open_log_file(path: &Path) -> Option<File> {
    let opened = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    match opened {
        Ok(file) => {
            debug!(path = ?path, "Apptainer runtime log file");
            Some(file)
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to open Apptainer runtime log file");
            None
        }
    }
}
