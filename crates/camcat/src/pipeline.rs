//! The three footage workflows.
//!
//! Every workflow has the same shape: discover, skip when there is nothing to do, then build and
//! run one conversion job per unit of work, strictly one after another. A failed job stops the
//! workflow; a cancelled job stops it without being treated as an error.

use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::catalog::{self, NamePattern, SEGMENT_EXTENSION};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::job::{ConversionJob, EncoderSettings, JobInput, JobStatus, JobSummary};
use crate::manifest::{self, ConcatManifest};
use crate::progress::ProgressSample;
use crate::template::{ParameterTemplate, CONCAT_COPY_PARAMETERS};

/// Top-level pipeline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Workflow {
    /// Merge each day's camera segments into `YYYYMMDD.mp4`
    CameraMerge,
    /// Time-compress each daily file into `YYYYMMDD_Accelerate.mp4`
    Accelerate,
    /// Merge all accelerated files into one
    AcceleratedMerge,
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Workflow::CameraMerge => "camera merge",
            Workflow::Accelerate => "accelerate",
            Workflow::AcceleratedMerge => "accelerated merge",
        };
        f.write_str(name)
    }
}

/// How one unit of work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOutcome {
    /// The unit had no input files
    SkippedEmpty,
    /// The output already exists and overwriting is off
    SkippedExisting,
    Succeeded,
    Failed,
    Cancelled,
}

/// How a whole workflow invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every planned unit reached a successful or skipped state
    Completed,
    /// Discovery found nothing to work on
    SkippedEmpty,
    /// A merge found a single file, so there was nothing to merge
    SkippedSingleton,
    Failed,
    Cancelled,
}

/// Identifies the job that failed a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetail {
    pub input: String,
    pub output: PathBuf,
    pub exit_code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub label: String,
    pub output: PathBuf,
    pub outcome: UnitOutcome,
    pub job: Option<JobSummary>,
}

/// Record of one workflow invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: Workflow,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    /// Units planned after discovery
    pub planned: usize,
    /// Units that reached a successful or skipped state; only ever increases during a run
    pub completed: usize,
    pub units: Vec<UnitReport>,
    pub detail: Option<String>,
    pub failure: Option<FailureDetail>,
}

impl RunReport {
    fn new(workflow: Workflow) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow,
            started_at: Utc::now(),
            finished_at: None,
            outcome: RunOutcome::Completed,
            planned: 0,
            completed: 0,
            units: Vec::new(),
            detail: None,
            failure: None,
        }
    }

    /// Number of encoder jobs that were started
    pub fn jobs_started(&self) -> usize {
        self.units.iter().filter(|u| u.job.is_some()).count()
    }

    /// Turn a failed run into the encoder error that caused it
    pub fn ensure_success(&self) -> Result<()> {
        match (&self.outcome, &self.failure) {
            (RunOutcome::Failed, Some(f)) => Err(PipelineError::Encoder {
                input: f.input.clone(),
                output: f.output.clone(),
                exit_code: f.exit_code,
                message: f.message.clone(),
            }),
            (RunOutcome::Failed, None) => Err(PipelineError::Encoder {
                input: String::new(),
                output: PathBuf::new(),
                exit_code: None,
                message: "run failed".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Write the report as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::io(path, std::io::Error::other(e)))?;
        std::fs::write(path, json).map_err(|e| PipelineError::io(path, e))
    }
}

/// Events published while a workflow runs
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Discovery finished with `units` pieces of work over `bytes` of input
    Planned { workflow: Workflow, units: usize, bytes: u64 },
    /// The whole stage was skipped
    StageSkipped { workflow: Workflow, outcome: RunOutcome, detail: String },
    UnitSkipped { index: usize, total: usize, label: String, outcome: UnitOutcome },
    JobStarted { index: usize, total: usize, job_id: Uuid, input: String, output: PathBuf, bytes: u64 },
    JobProgress { index: usize, total: usize, sample: ProgressSample, overall_percent: f64 },
    JobFinished { index: usize, total: usize, job_id: Uuid, output: PathBuf, status: JobStatus },
}

/// Input of a planned unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitInput {
    /// Nothing to encode
    Empty,
    Single(PathBuf),
    /// Concatenate `files`, in order, through a manifest at `manifest`
    Concat { manifest: PathBuf, files: Vec<PathBuf> },
}

/// One piece of work decided by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUnit {
    pub label: String,
    pub input: UnitInput,
    pub output: PathBuf,
    /// Total size of the unit's input files
    pub bytes: u64,
}

/// Result of discovery for a workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Skip { outcome: RunOutcome, detail: String },
    Units(Vec<PlannedUnit>),
}

/// Runs workflows against one configuration
pub struct Pipeline {
    config: PipelineConfig,
    settings: EncoderSettings,
    accelerate_template: ParameterTemplate,
    concat_template: ParameterTemplate,
    cancel: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl Pipeline {
    /// Validate the configuration and build a pipeline. Fails before any discovery when a
    /// directory is missing or the template is malformed.
    pub fn new(config: PipelineConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        let accelerate_template = config.accelerate_template()?;
        let concat_template = ParameterTemplate::parse(CONCAT_COPY_PARAMETERS)?;
        let settings = EncoderSettings::from_config(&config);

        info!(
            "Pipeline ready: camera={}, output={}, threads={}, overwrite={}",
            config.camera_directory.display(),
            config.output_directory.display(),
            settings.threads,
            settings.overwrite
        );

        Ok(Self {
            config,
            settings,
            accelerate_template,
            concat_template,
            cancel,
            event_tx: None,
        })
    }

    /// Publish [`PipelineEvent`]s to `tx` while running
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                debug!("No subscriber for pipeline event");
            }
        }
    }

    /// Discover the work for `workflow` without running anything
    pub fn plan(&self, workflow: Workflow) -> Result<Plan> {
        let output_dir = &self.config.output_directory;

        match workflow {
            Workflow::CameraMerge => {
                let groups = catalog::discover_date_groups(&self.config.camera_directory)?;
                if groups.is_empty() {
                    return Ok(Plan::Skip {
                        outcome: RunOutcome::SkippedEmpty,
                        detail: format!(
                            "no camera directories matching {}",
                            NamePattern::HourDirectory.describe()
                        ),
                    });
                }

                let units = groups
                    .into_iter()
                    .map(|group| {
                        let output = output_dir.join(format!("{}.{}", group.date, SEGMENT_EXTENSION));
                        let input = if group.files.is_empty() {
                            UnitInput::Empty
                        } else {
                            UnitInput::Concat {
                                manifest: manifest::manifest_path(output_dir, &group.date),
                                files: group.paths(),
                            }
                        };
                        PlannedUnit { bytes: group.total_bytes(), label: group.date, input, output }
                    })
                    .collect();
                Ok(Plan::Units(units))
            }

            Workflow::Accelerate => {
                let files = catalog::discover_files(output_dir, NamePattern::DailyMerged)?;
                if files.is_empty() {
                    return Ok(Plan::Skip {
                        outcome: RunOutcome::SkippedEmpty,
                        detail: format!("no files matching {}", NamePattern::DailyMerged.describe()),
                    });
                }

                let units = files
                    .into_iter()
                    .map(|file| PlannedUnit {
                        output: output_dir.join(catalog::accelerated_name(&file)),
                        label: file.key.clone(),
                        bytes: file.bytes,
                        input: UnitInput::Single(file.path),
                    })
                    .collect();
                Ok(Plan::Units(units))
            }

            Workflow::AcceleratedMerge => {
                let files = catalog::discover_files(output_dir, NamePattern::Accelerated)?;
                let (first, last) = match files.as_slice() {
                    [] => {
                        return Ok(Plan::Skip {
                            outcome: RunOutcome::SkippedEmpty,
                            detail: format!("no files matching {}", NamePattern::Accelerated.describe()),
                        })
                    }
                    [only] => {
                        return Ok(Plan::Skip {
                            outcome: RunOutcome::SkippedSingleton,
                            detail: format!("only {} found, nothing to merge", only.key),
                        })
                    }
                    [first, .., last] => (first, last),
                };

                let key = catalog::merged_range_key(first, last);
                let unit = PlannedUnit {
                    output: output_dir.join(format!("{}.{}", key, SEGMENT_EXTENSION)),
                    input: UnitInput::Concat {
                        manifest: manifest::manifest_path(output_dir, &key),
                        files: files.iter().map(|f| f.path.clone()).collect(),
                    },
                    label: key,
                    bytes: files.iter().map(|f| f.bytes).sum(),
                };
                Ok(Plan::Units(vec![unit]))
            }
        }
    }

    /// Run `workflow` to completion, skip, failure or cancellation.
    ///
    /// Only discovery problems are returned as errors. Encoder failures end the run with
    /// [`RunOutcome::Failed`]; use [`RunReport::ensure_success`] to surface them.
    pub async fn run(&self, workflow: Workflow) -> Result<RunReport> {
        let mut report = RunReport::new(workflow);
        info!("▶️  Starting {} (run {})", workflow, report.run_id);

        let units = match self.plan(workflow)? {
            Plan::Skip { outcome, detail } => {
                warn!("⚠️  Skipping {}: {}", workflow, detail);
                self.emit(PipelineEvent::StageSkipped { workflow, outcome, detail: detail.clone() });
                report.outcome = outcome;
                report.detail = Some(detail);
                report.finished_at = Some(Utc::now());
                return Ok(report);
            }
            Plan::Units(units) => units,
        };

        let total = units.len();
        let bytes: u64 = units.iter().map(|u| u.bytes).sum();
        report.planned = total;
        info!("Planned {} unit(s) for {} ({} bytes of input)", total, workflow, bytes);
        self.emit(PipelineEvent::Planned { workflow, units: total, bytes });

        for (index, unit) in units.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested; {} unit(s) not started", total - index);
                report.outcome = RunOutcome::Cancelled;
                break;
            }

            if let Some(outcome) = self.skip_reason(&unit) {
                info!("⏭️  [{}/{}] {}: {:?}", index + 1, total, unit.label, outcome);
                self.emit(PipelineEvent::UnitSkipped {
                    index,
                    total,
                    label: unit.label.clone(),
                    outcome,
                });
                report.units.push(UnitReport {
                    label: unit.label,
                    output: unit.output,
                    outcome,
                    job: None,
                });
                report.completed += 1;
                continue;
            }

            let mut job = match self.build_job(&unit) {
                Ok(job) => job,
                Err(e) => {
                    error!("❌ [{}/{}] could not prepare {}: {}", index + 1, total, unit.label, e);
                    report.failure = Some(FailureDetail {
                        input: unit.label.clone(),
                        output: unit.output.clone(),
                        exit_code: None,
                        message: e.to_string(),
                    });
                    report.units.push(UnitReport {
                        label: unit.label,
                        output: unit.output,
                        outcome: UnitOutcome::Failed,
                        job: None,
                    });
                    report.outcome = RunOutcome::Failed;
                    break;
                }
            };

            let status = self.run_job(&mut job, &unit, index, total, report.completed).await;
            let summary = job.summary();
            let outcome = match status {
                JobStatus::Succeeded => UnitOutcome::Succeeded,
                JobStatus::Cancelled => UnitOutcome::Cancelled,
                _ => UnitOutcome::Failed,
            };
            report.units.push(UnitReport {
                label: unit.label,
                output: unit.output,
                outcome,
                job: Some(summary),
            });

            match outcome {
                UnitOutcome::Succeeded => report.completed += 1,
                UnitOutcome::Cancelled => {
                    report.outcome = RunOutcome::Cancelled;
                    break;
                }
                _ => {
                    report.failure = Some(FailureDetail {
                        input: job.input_label(),
                        output: job.output().to_path_buf(),
                        exit_code: job.exit_code(),
                        message: job.failure().unwrap_or_default().to_string(),
                    });
                    report.outcome = RunOutcome::Failed;
                    break;
                }
            }
        }

        report.finished_at = Some(Utc::now());
        match report.outcome {
            RunOutcome::Completed => info!("🎉 {} finished: {}/{} unit(s)", workflow, report.completed, total),
            RunOutcome::Cancelled => warn!("{} cancelled after {}/{} unit(s)", workflow, report.completed, total),
            _ => error!("{} failed after {}/{} unit(s)", workflow, report.completed, total),
        }
        Ok(report)
    }

    fn skip_reason(&self, unit: &PlannedUnit) -> Option<UnitOutcome> {
        if unit.input == UnitInput::Empty {
            return Some(UnitOutcome::SkippedEmpty);
        }
        if !self.config.overwrite_output && unit.output.exists() {
            return Some(UnitOutcome::SkippedExisting);
        }
        None
    }

    /// Build the job for a unit, writing its manifest first when it concatenates
    fn build_job(&self, unit: &PlannedUnit) -> Result<ConversionJob> {
        let (input, template) = match &unit.input {
            UnitInput::Single(path) => (JobInput::File(path.clone()), self.accelerate_template.clone()),
            UnitInput::Concat { manifest, files } => (
                JobInput::Concat(ConcatManifest::write(manifest, files)?),
                self.concat_template.clone(),
            ),
            UnitInput::Empty => {
                return Err(PipelineError::Configuration(format!("{} has no input", unit.label)))
            }
        };
        Ok(ConversionJob::new(input, unit.output.clone(), template))
    }

    async fn run_job(
        &self,
        job: &mut ConversionJob,
        unit: &PlannedUnit,
        index: usize,
        total: usize,
        completed: usize,
    ) -> JobStatus {
        info!("🎬 [{}/{}] {} -> {}", index + 1, total, job.input_label(), job.output().display());
        self.emit(PipelineEvent::JobStarted {
            index,
            total,
            job_id: job.id,
            input: job.input_label(),
            output: job.output().to_path_buf(),
            bytes: unit.bytes,
        });

        let job_id = job.id;
        let output = job.output().to_path_buf();
        let progress = job.take_progress();
        let forward = async move {
            let Some(mut stream) = progress else { return };
            while let Some(sample) = stream.next().await {
                let overall_percent = overall_percent(completed, total, sample.percent);
                debug!("[{}/{}] {:.1}% ({:?})", index + 1, total, sample.percent, sample.elapsed);
                self.emit(PipelineEvent::JobProgress { index, total, sample, overall_percent });
            }
        };

        let (status, ()) = tokio::join!(job.run(&self.settings, &self.cancel), forward);

        self.emit(PipelineEvent::JobFinished { index, total, job_id, output, status });
        status
    }
}

/// Aggregate progress across a run: finished units plus the current job's share
pub fn overall_percent(completed: usize, total: usize, job_percent: f64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let done = completed as f64 + crate::progress::clamp_percent(job_percent) / 100.0;
    crate::progress::clamp_percent(done / total as f64 * 100.0)
}
