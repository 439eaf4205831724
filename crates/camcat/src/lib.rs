pub mod config;
pub mod error;
pub mod catalog;
pub mod manifest;
pub mod template;
pub mod progress;
pub mod job;
pub mod pipeline;


pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use job::{ConversionJob, EncoderSettings, JobInput, JobStatus, JobSummary};
pub use pipeline::{Pipeline, PipelineEvent, RunOutcome, RunReport, UnitOutcome, Workflow};
pub use progress::{ProgressSample, ProgressStream};
