use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::manifest::ConcatManifest;
use crate::progress::{ProgressParser, ProgressSample, ProgressStream};
use crate::template::{InputArgs, ParameterTemplate};

/// Stderr lines kept for failure messages
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the stderr reader after the encoder has exited
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// How every job invokes the encoder
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// `-threads` hint
    pub threads: u32,
    /// `-y` when true, `-n` (fail if the destination exists) when false
    pub overwrite: bool,
    /// Time a cancelled encoder gets to quit before it is killed
    pub cancel_grace: Duration,
}

impl EncoderSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            threads: cfg.resolved_threads(),
            overwrite: cfg.overwrite_output,
            cancel_grace: cfg.cancel_grace(),
        }
    }

    /// Arguments placed ahead of the template on every invocation
    fn global_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            if self.overwrite { "-y" } else { "-n" }.to_string(),
            "-nostats".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
            "-threads".to_string(),
            self.threads.to_string(),
        ]
    }
}

/// What a job reads
#[derive(Debug)]
pub enum JobInput {
    /// One source file
    File(PathBuf),
    /// Several files listed in a concat manifest owned by the job
    Concat(ConcatManifest),
}

impl JobInput {
    fn args(&self) -> InputArgs {
        match self {
            JobInput::File(path) => InputArgs::file(path),
            JobInput::Concat(manifest) => InputArgs::concat(manifest.path()),
        }
    }

    fn label(&self) -> String {
        match self {
            JobInput::File(path) => path.display().to_string(),
            JobInput::Concat(manifest) => {
                format!("{} ({} files)", manifest.path().display(), manifest.len())
            }
        }
    }
}

/// Serializable view of a job, used in run reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub input: String,
    pub output: PathBuf,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
}

/// A single encoder invocation.
///
/// A job runs at most once: `Pending -> Running -> {Succeeded, Failed, Cancelled}`.
#[derive(Debug)]
pub struct ConversionJob {
    pub id: Uuid,
    input: JobInput,
    output: PathBuf,
    template: ParameterTemplate,
    status: JobStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    failure: Option<String>,
    progress_tx: Option<mpsc::UnboundedSender<ProgressSample>>,
    progress_rx: Option<ProgressStream>,
}

impl ConversionJob {
    pub fn new(input: JobInput, output: PathBuf, template: ParameterTemplate) -> Self {
        let (tx, rx) = ProgressStream::channel();
        Self {
            id: Uuid::new_v4(),
            input,
            output,
            template,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure: None,
            progress_tx: Some(tx),
            progress_rx: Some(rx),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn input_label(&self) -> String {
        self.input.label()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Take the job's progress stream. Only the first call returns it.
    pub fn take_progress(&mut self) -> Option<ProgressStream> {
        self.progress_rx.take()
    }

    /// Where the encoder writes until it succeeds; renamed to [`Self::output`] afterwards
    pub fn staging_path(&self) -> PathBuf {
        staging_path(&self.output)
    }

    /// Full encoder argument list for this job
    pub fn build_args(&self, settings: &EncoderSettings) -> Result<Vec<String>> {
        let mut args = settings.global_args();
        args.extend(self.template.render(&self.input.args(), &self.staging_path())?);
        Ok(args)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            input: self.input_label(),
            output: self.output.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            failure: self.failure.clone(),
        }
    }

    /// The error to surface when this job failed
    pub fn error(&self) -> Option<PipelineError> {
        (self.status == JobStatus::Failed).then(|| PipelineError::Encoder {
            input: self.input_label(),
            output: self.output.clone(),
            exit_code: self.exit_code,
            message: self.failure.clone().unwrap_or_default(),
        })
    }

    /// Run the encoder to a terminal state.
    ///
    /// Cancellation asks the encoder to quit, waits up to the grace period, then kills and reaps
    /// it. The concat manifest, if any, is released on every path.
    pub async fn run(&mut self, settings: &EncoderSettings, cancel: &CancellationToken) -> JobStatus {
        if self.status != JobStatus::Pending {
            warn!("Job {} already ran ({:?}); not starting it again", self.id, self.status);
            return self.status;
        }

        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        // Samples are only buffered for a consumer that took the stream before the start
        self.progress_rx = None;
        let progress_tx = self.progress_tx.take();

        let status = self.execute(settings, cancel, progress_tx).await;

        self.status = status;
        self.finished_at = Some(Utc::now());
        if let JobInput::Concat(manifest) = &mut self.input {
            manifest.release();
        }

        match status {
            JobStatus::Succeeded => info!("✅ Job {} succeeded: {}", self.id, self.output.display()),
            JobStatus::Cancelled => warn!("⏹️  Job {} cancelled: {}", self.id, self.output.display()),
            _ => error!(
                "❌ Job {} failed: {}",
                self.id,
                self.failure.as_deref().unwrap_or("unknown error")
            ),
        }
        status
    }

    async fn execute(
        &mut self,
        settings: &EncoderSettings,
        cancel: &CancellationToken,
        progress_tx: Option<mpsc::UnboundedSender<ProgressSample>>,
    ) -> JobStatus {
        if cancel.is_cancelled() {
            return JobStatus::Cancelled;
        }

        let args = match self.build_args(settings) {
            Ok(args) => args,
            Err(e) => {
                self.failure = Some(e.to_string());
                return JobStatus::Failed;
            }
        };
        debug!("Executing {} {}", settings.ffmpeg_bin.display(), args.join(" "));

        // A leftover from an interrupted run would make `-n` refuse to start
        let staging = self.staging_path();
        if staging.exists() {
            if let Err(e) = std::fs::remove_file(&staging) {
                warn!("Could not remove stale partial output {}: {}", staging.display(), e);
            }
        }

        let mut child = match Command::new(&settings.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.failure = Some(format!(
                    "failed to launch {}: {}",
                    settings.ffmpeg_bin.display(),
                    e
                ));
                return JobStatus::Failed;
            }
        };

        let mut reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_stderr(stderr, progress_tx)));

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match exited {
            Some(Ok(exit)) => {
                self.exit_code = exit.code();
                if exit.success() {
                    JobStatus::Succeeded
                } else {
                    JobStatus::Failed
                }
            }
            Some(Err(e)) => {
                self.failure = Some(format!("failed to wait for encoder: {}", e));
                JobStatus::Failed
            }
            None => {
                terminate(&mut child, settings.cancel_grace).await;
                JobStatus::Cancelled
            }
        };

        let tail = match reader.as_mut() {
            Some(handle) => match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut *handle).await {
                Ok(Ok(tail)) => tail,
                Ok(Err(e)) => {
                    warn!("Encoder output reader ended abnormally: {}", e);
                    Vec::new()
                }
                Err(_) => {
                    handle.abort();
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if status == JobStatus::Failed && self.failure.is_none() {
            let detail = tail.last().cloned().unwrap_or_default();
            self.failure = Some(match self.exit_code {
                Some(code) => format!("encoder exited with status {}: {}", code, detail),
                None => format!("encoder terminated by signal: {}", detail),
            });
            debug!("Encoder stderr tail:\n{}", tail.join("\n"));
        }

        if status == JobStatus::Succeeded {
            if let Err(e) = tokio::fs::rename(&staging, &self.output).await {
                self.failure = Some(format!(
                    "failed to move {} into place: {}",
                    staging.display(),
                    e
                ));
                return JobStatus::Failed;
            }
        }

        status
    }
}

/// Ask the encoder to stop, then kill it if it does not exit within `grace`
async fn terminate(child: &mut Child, grace: Duration) {
    info!("Waiting for encoder to exit...");

    // ffmpeg finishes the current output cleanly on `q`
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q\n").await {
            debug!("Could not send quit request to encoder: {}", e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Encoder exited after cancellation: {}", status),
        Ok(Err(e)) => warn!("Failed to wait for cancelled encoder: {}", e),
        Err(_) => {
            warn!("Encoder did not exit within {:?}; killing it", grace);
            // kill() also reaps the process
            if let Err(e) = child.kill().await {
                warn!("Failed to kill encoder: {}", e);
            }
        }
    }
}

/// Forward progress samples and keep the last non-progress lines for error reporting
async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    progress_tx: Option<mpsc::UnboundedSender<ProgressSample>>,
) -> Vec<String> {
    let mut parser = ProgressParser::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Stopped reading encoder output: {}", e);
                break;
            }
        }
        // File names in the banner are not always UTF-8
        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(['\r', '\n']);

        if let Some(sample) = parser.feed_line(line) {
            if let Some(tx) = &progress_tx {
                // A dropped receiver only means nobody is listening
                let _ = tx.send(sample);
            }
            continue;
        }
        if is_progress_field(line) {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    tail.into_iter().collect()
}

/// `<stem>.partial.<ext>` next to `output`, so an interrupted encode never carries the final name
pub fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    output.with_file_name(name)
}

/// `key=value` lines of a `-progress` block, such as `bitrate=  12.3kbits/s`
fn is_progress_field(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        None => false,
    }
}
