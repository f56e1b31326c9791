//! Output coordinator (§4.5): owns a node's log file, optional stdout/stderr
//! redirects, and the output-variable capture buffer. Exposes two
//! [`crate::executor::OutputSink`] handles (stdout/stderr) that share this
//! state behind a single async mutex, so fan-out never needs unsafe
//! synchronization and writes interleave in arrival order.

use crate::error::SchedulerError;
use crate::executor::{OutputSink, Sink};
use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

const MASK_PLACEHOLDER: &str = "*****";

struct CaptureState {
    buf: Vec<u8>,
    exceeded: bool,
}

struct Inner {
    log: Option<BufWriter<File>>,
    stdout_redirect: Option<BufWriter<File>>,
    stderr_redirect: Option<BufWriter<File>>,
    capture: Option<CaptureState>,
    mask_values: Vec<String>,
    max_output_size: usize,
    stdout_linebuf: Vec<u8>,
    stderr_linebuf: Vec<u8>,
    torn_down: bool,
}

impl Inner {
    fn mask(&self, line: &str) -> String {
        if self.mask_values.is_empty() {
            return line.to_string();
        }
        let mut masked = line.to_string();
        for secret in &self.mask_values {
            if secret.is_empty() {
                continue;
            }
            masked = masked.replace(secret.as_str(), MASK_PLACEHOLDER);
        }
        masked
    }

    fn record_capture(&mut self, data: &[u8]) {
        if let Some(cap) = self.capture.as_mut() {
            if !cap.exceeded {
                cap.buf.extend_from_slice(data);
                if self.max_output_size > 0 && cap.buf.len() > self.max_output_size {
                    cap.exceeded = true;
                }
            }
        }
    }

    async fn write_line(&mut self, target: Target, masked: &str) -> std::io::Result<()> {
        if let Some(w) = &mut self.log {
            w.write_all(masked.as_bytes()).await?;
            w.write_all(b"\n").await?;
        }
        match target {
            Target::Stdout => {
                if let Some(w) = &mut self.stdout_redirect {
                    w.write_all(masked.as_bytes()).await?;
                    w.write_all(b"\n").await?;
                }
            }
            Target::Stderr => {
                if let Some(w) = &mut self.stderr_redirect {
                    w.write_all(masked.as_bytes()).await?;
                    w.write_all(b"\n").await?;
                } else if let Some(w) = &mut self.stdout_redirect {
                    // No dedicated stderr redirect: stderr shares stdout's
                    // multi-writer fan-out (§4.5).
                    w.write_all(masked.as_bytes()).await?;
                    w.write_all(b"\n").await?;
                }
            }
        }
        Ok(())
    }

    async fn on_chunk(&mut self, target: Target, data: &[u8]) -> std::io::Result<()> {
        // Capture only reads stdout, unless stderr has no dedicated redirect,
        // in which case it flows through "the same multi-writer as stdout"
        // (§4.5) and is captured too.
        if target == Target::Stdout || self.stderr_redirect.is_none() {
            self.record_capture(data);
        }

        let linebuf = match target {
            Target::Stdout => &mut self.stdout_linebuf,
            Target::Stderr => &mut self.stderr_linebuf,
        };
        linebuf.extend_from_slice(data);
        let lines = extract_complete_lines(linebuf);
        for line in lines {
            let text = String::from_utf8_lossy(&line).into_owned();
            let masked = self.mask(&text);
            self.write_line(target, &masked).await?;
        }
        Ok(())
    }

    async fn flush_trailing(&mut self) -> std::io::Result<()> {
        if !self.stdout_linebuf.is_empty() {
            let text = String::from_utf8_lossy(&std::mem::take(&mut self.stdout_linebuf)).into_owned();
            let masked = self.mask(&text);
            self.write_line(Target::Stdout, &masked).await?;
        }
        if !self.stderr_linebuf.is_empty() {
            let text = String::from_utf8_lossy(&std::mem::take(&mut self.stderr_linebuf)).into_owned();
            let masked = self.mask(&text);
            self.write_line(Target::Stderr, &masked).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
}

fn extract_complete_lines(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for i in 0..buf.len() {
        if buf[i] == b'\n' {
            lines.push(buf[start..i].to_vec());
            start = i + 1;
        }
    }
    buf.drain(0..start);
    lines
}

/// Shared handle wiring a node's output to its coordinator. Cheap to clone.
#[derive(Clone)]
pub struct OutputCoordinator {
    inner: Arc<Mutex<Inner>>,
    log_path: PathBuf,
}

struct StdoutHandle(Arc<Mutex<Inner>>);
struct StderrHandle(Arc<Mutex<Inner>>);

#[async_trait]
impl OutputSink for StdoutHandle {
    async fn write_chunk(&self, data: &[u8]) -> std::io::Result<()> {
        self.0.lock().await.on_chunk(Target::Stdout, data).await
    }
    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OutputSink for StderrHandle {
    async fn write_chunk(&self, data: &[u8]) -> std::io::Result<()> {
        self.0.lock().await.on_chunk(Target::Stderr, data).await
    }
    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

impl OutputCoordinator {
    /// Opens the log file (truncated fresh) and optional redirect files
    /// (append, created with mode 0644; parent directories created with
    /// mode 0750). `mask_values` are the literal secrets to redact from
    /// every line before it reaches any file.
    pub async fn setup(
        log_path: PathBuf,
        stdout_redirect: Option<PathBuf>,
        stderr_redirect: Option<PathBuf>,
        capture_enabled: bool,
        mask_values: Vec<String>,
        max_output_size: usize,
    ) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            create_dir_all_0750(parent).await?;
        }
        let log = BufWriter::new(File::create(&log_path).await?);

        let stdout_redirect = match stdout_redirect {
            Some(path) => Some(BufWriter::new(open_append_0644(&path).await?)),
            None => None,
        };
        let stderr_redirect = match stderr_redirect {
            Some(path) => Some(BufWriter::new(open_append_0644(&path).await?)),
            None => None,
        };

        let inner = Inner {
            log: Some(log),
            stdout_redirect,
            stderr_redirect,
            capture: capture_enabled.then(|| CaptureState {
                buf: Vec::new(),
                exceeded: false,
            }),
            mask_values,
            max_output_size,
            stdout_linebuf: Vec::new(),
            stderr_linebuf: Vec::new(),
            torn_down: false,
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            log_path,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn stdout_sink(&self) -> Sink {
        Arc::new(StdoutHandle(self.inner.clone()))
    }

    pub fn stderr_sink(&self) -> Sink {
        Arc::new(StderrHandle(self.inner.clone()))
    }

    /// Returns the trimmed captured stdout (and, if no stderr redirect was
    /// configured, stderr) value, or an error if it exceeded
    /// `max_output_size`.
    pub async fn captured_output(&self, limit: usize) -> Result<Option<String>, SchedulerError> {
        let inner = self.inner.lock().await;
        match &inner.capture {
            None => Ok(None),
            Some(cap) if cap.exceeded => Err(SchedulerError::OutputSizeExceeded {
                size: cap.buf.len(),
                limit,
            }),
            Some(cap) => Ok(Some(
                String::from_utf8_lossy(&cap.buf).trim().to_string(),
            )),
        }
    }

    /// Flushes and closes every writer. Idempotent: a second call is a no-op.
    pub async fn teardown(&self) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        if inner.torn_down {
            return Ok(());
        }
        let result: std::io::Result<()> = async {
            inner.flush_trailing().await?;
            if let Some(w) = inner.log.as_mut() {
                w.flush().await?;
                w.get_ref().sync_all().await?;
            }
            if let Some(w) = inner.stdout_redirect.as_mut() {
                w.flush().await?;
            }
            if let Some(w) = inner.stderr_redirect.as_mut() {
                w.flush().await?;
            }
            Ok(())
        }
        .await;

        inner.log = None;
        inner.stdout_redirect = None;
        inner.stderr_redirect = None;
        inner.torn_down = true;

        result.map_err(|e| SchedulerError::TeardownError(e.to_string()))
    }
}

async fn create_dir_all_0750(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o750);
        let _ = tokio::fs::set_permissions(dir, perms).await;
    }
    Ok(())
}

async fn open_append_0644(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all_0750(parent).await?;
        }
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path).await
}

/// Replaces filesystem-unsafe characters and path separators in a step name
/// with `_`, for use in log filenames (§6).
pub fn safe_step_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            c => c,
        })
        .collect()
}

/// Builds `<log_dir>/<safe-step-name>.<YYYYMMDD.HH:MM:SS.mmm>.<run-id-prefix>.log`.
pub fn build_log_path(log_dir: &Path, step_name: &str, run_id: &str) -> PathBuf {
    let safe = safe_step_name(step_name);
    let timestamp = Local::now().format("%Y%m%d.%H:%M:%S%.3f").to_string();
    let prefix: String = run_id.chars().take(8).collect();
    log_dir.join(format!("{safe}.{timestamp}.{prefix}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn safe_step_name_replaces_separators() {
        assert_eq!(safe_step_name("a/b:c d"), "a_b_c_d");
    }

    #[test]
    fn build_log_path_has_expected_shape() {
        let dir = tempdir().unwrap();
        let path = build_log_path(dir.path(), "my step", "0123456789abcdef");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("my_step."));
        assert!(name.ends_with(".01234567.log"));
    }

    #[tokio::test]
    async fn captures_stdout_and_masks_secrets_in_log() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("step.log");
        let coord = OutputCoordinator::setup(
            log_path.clone(),
            None,
            None,
            true,
            vec!["s3cr3t".to_string()],
            0,
        )
        .await
        .unwrap();

        let stdout = coord.stdout_sink();
        stdout.write_chunk(b"token=s3cr3t\n").await.unwrap();
        stdout.write_chunk(b"done\n").await.unwrap();

        let captured = coord.captured_output(0).await.unwrap();
        assert_eq!(captured.as_deref(), Some("token=s3cr3t\ndone"));

        coord.teardown().await.unwrap();
        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(contents.contains("token=*****"));
        assert!(!contents.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn output_size_exceeded_is_reported() {
        let dir = tempdir().unwrap();
        let coord = OutputCoordinator::setup(
            dir.path().join("step.log"),
            None,
            None,
            true,
            vec![],
            4,
        )
        .await
        .unwrap();
        let stdout = coord.stdout_sink();
        stdout.write_chunk(b"too much data").await.unwrap();
        let err = coord.captured_output(4).await.unwrap_err();
        assert!(matches!(err, SchedulerError::OutputSizeExceeded { .. }));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let dir = tempdir().unwrap();
        let coord = OutputCoordinator::setup(dir.path().join("step.log"), None, None, false, vec![], 0)
            .await
            .unwrap();
        coord.teardown().await.unwrap();
        coord.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn stderr_without_redirect_shares_stdout_redirect() {
        let dir = tempdir().unwrap();
        let stdout_path = dir.path().join("out.txt");
        let coord = OutputCoordinator::setup(
            dir.path().join("step.log"),
            Some(stdout_path.clone()),
            None,
            false,
            vec![],
            0,
        )
        .await
        .unwrap();
        coord.stderr_sink().write_chunk(b"uh oh\n").await.unwrap();
        coord.teardown().await.unwrap();
        let contents = tokio::fs::read_to_string(&stdout_path).await.unwrap();
        assert_eq!(contents, "uh oh\n");
    }
}
