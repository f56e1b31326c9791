//! The executor interface (§6 "Executor factory") and its one reference
//! implementation: a local shell process. The scheduler core only ever talks
//! to the [`Executor`] trait — docker/ssh/HTTP/child-DAG backends are out of
//! scope but would plug in at this same seam.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone)]
pub enum ExecutorError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("process exited with status {0}")]
    ExitStatus(i32),

    #[error("process terminated by signal {0}")]
    Signaled(i32),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("failed to signal process: {0}")]
    Kill(String),
}

/// A fan-out destination for a stream of output chunks. The output
/// coordinator (§4.5) is the only real implementation; tests use a simple
/// in-memory one.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write_chunk(&self, data: &[u8]) -> std::io::Result<()>;
    async fn flush(&self) -> std::io::Result<()>;
}

pub type Sink = Arc<dyn OutputSink>;

/// A running (or about-to-run) unit of work. `run` and `kill` both take `&self`
/// so a live handle can be shared (behind an `Arc`) between the task driving
/// the process to completion and a concurrent caller delivering a signal —
/// mutable state lives behind interior mutability instead.
#[async_trait]
pub trait Executor: Send + Sync {
    fn set_stdout(&self, sink: Sink);
    fn set_stderr(&self, sink: Sink);

    /// Runs to completion or until `cancel` fires. On success the process
    /// exited with status 0. A non-zero exit or signal termination is
    /// reported as `Err`, with `exit_code()` populated either way.
    async fn run(&self, cancel: CancellationToken) -> Result<(), ExecutorError>;

    /// The process's exit code, if one was observed. `-1` denotes signal
    /// termination, `None` means the process never ran.
    fn exit_code(&self) -> Option<i32>;

    /// Sends `signal` (a name like `"SIGTERM"`) to the running process. Safe
    /// to call while `run` is still in flight on another task.
    async fn kill(&self, signal: &str) -> Result<(), ExecutorError>;
}

/// Spawns `program` with `args` as a plain local child process. The pid is
/// published as soon as the child is spawned, independent of the `child.wait()`
/// borrow `run` holds for the lifetime of the process, so `kill` can reach a
/// running process without waiting for `run` to return.
pub struct ShellExecutor {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: HashMap<String, String>,
    stdout_sink: Mutex<Option<Sink>>,
    stderr_sink: Mutex<Option<Sink>>,
    pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
}

impl ShellExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            dir: None,
            env: HashMap::new(),
            stdout_sink: Mutex::new(None),
            stderr_sink: Mutex::new(None),
            pid: Mutex::new(None),
            exit_code: Mutex::new(None),
        }
    }

    pub fn with_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dir = dir;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }
}

/// Reads from `reader` and forwards chunks to `sink` as they arrive, so the
/// kernel pipe buffer never fills while the child blocks on a full pipe
/// (§9 "Output-capture pipe deadlock").
async fn pump<R>(reader: Option<R>, sink: Option<Sink>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    let (Some(mut reader), Some(sink)) = (reader, sink) else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write_chunk(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.flush().await;
}

#[async_trait]
impl Executor for ShellExecutor {
    fn set_stdout(&self, sink: Sink) {
        *self.stdout_sink.lock().unwrap() = Some(sink);
    }

    fn set_stderr(&self, sink: Sink) {
        *self.stderr_sink.lock().unwrap() = Some(sink);
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), ExecutorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(program = %self.program, args = ?self.args, "spawning process");
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", self.program)))?;
        *self.pid.lock().unwrap() = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_sink = self.stdout_sink.lock().unwrap().clone();
        let stderr_sink = self.stderr_sink.lock().unwrap().clone();
        let stdout_task = tokio::spawn(pump(stdout, stdout_sink));
        let stderr_task = tokio::spawn(pump(stderr, stderr_sink));

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                let _ = child.wait().await;
                *self.exit_code.lock().unwrap() = Some(-1);
                return Err(ExecutorError::Signaled(-1));
            }
            status = child.wait() => status.map_err(|e| ExecutorError::Io(e.to_string()))?,
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                *self.exit_code.lock().unwrap() = Some(-1);
                return Err(ExecutorError::Signaled(sig));
            }
        }

        let code = status.code().unwrap_or(1);
        *self.exit_code.lock().unwrap() = Some(code);
        if status.success() {
            Ok(())
        } else {
            Err(ExecutorError::ExitStatus(code))
        }
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    async fn kill(&self, signal: &str) -> Result<(), ExecutorError> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        tracing::debug!(signal, pid, "signalling process");
        send_signal(pid, signal).await
    }
}

#[cfg(unix)]
async fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    if matches!(child.try_wait(), Ok(None)) {
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    let _ = child.kill().await;
}

/// Delivers `signal` to the process group of the still-running child
/// identified by `pid`. Takes a bare pid rather than `&mut Child` so it can
/// be called from `kill` while `run` still owns the `Child` itself.
#[cfg(unix)]
async fn send_signal(pid: u32, signal: &str) -> Result<(), ExecutorError> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::str::FromStr;

    let sig = Signal::from_str(signal)
        .map_err(|_| ExecutorError::Kill(format!("unknown signal '{signal}'")))?;
    killpg(Pid::from_raw(pid as i32), sig).map_err(|e| ExecutorError::Kill(e.to_string()))
}

#[cfg(not(unix))]
async fn send_signal(pid: u32, _signal: &str) -> Result<(), ExecutorError> {
    // best-effort: std::process has no portable "signal an arbitrary pid" API
    // outside of unix, so fall back to a no-op and let overall cancellation
    // (which still owns the Child) terminate the process.
    let _ = pid;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<u8>>);

    #[async_trait]
    impl OutputSink for Capture {
        async fn write_chunk(&self, data: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        async fn flush(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_successful_command() {
        let exec = ShellExecutor::new("true", vec![]);
        let result = exec.run(CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(exec.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn captures_nonzero_exit_code() {
        let exec = ShellExecutor::new("false", vec![]);
        let result = exec.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ExecutorError::ExitStatus(1))));
        assert_eq!(exec.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn pumps_stdout_into_sink() {
        let exec = ShellExecutor::new("echo", vec!["hello".into()]);
        let capture = Arc::new(Capture::default());
        exec.set_stdout(capture.clone());
        let _ = exec.run(CancellationToken::new()).await;
        assert_eq!(
            String::from_utf8(capture.0.lock().unwrap().clone()).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn cancellation_terminates_running_process() {
        let exec = ShellExecutor::new("sleep", vec!["5".into()]);
        let token = CancellationToken::new();
        let child_token = token.clone();
        let handle = tokio::spawn(async move { exec.run(child_token).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(3), handle)
            .await
            .expect("executor did not observe cancellation in time")
            .unwrap();
        assert!(matches!(result, Err(ExecutorError::Signaled(-1))));
    }
}
