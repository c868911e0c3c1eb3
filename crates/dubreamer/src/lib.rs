//! Engine of the dubreamer HLS relay.
//!
//! Each configured stream gets a [`pipeline::StreamPipeline`] that polls the
//! upstream playlist, downloads and analyzes new segments, and maintains a
//! rewritten sliding-window playlist. A [`supervisor::StreamSupervisor`] owns
//! the pipelines and applies lifecycle commands to them.

pub mod config;
pub mod error;
pub mod health;
pub mod hls;
pub mod pipeline;
pub mod supervisor;

pub use config::{Config, ConfigError, ConfigLoader, StreamConfig, ValidationOptions};
pub use error::{ErrorCategory, RelayError};
pub use health::{HealthReport, HealthStatus, PipelineState, StreamHealthReport, StreamStatus};
pub use pipeline::{CycleOutcome, StreamPipeline};
pub use supervisor::{
    ReloadSummary, ShutdownReport, StreamSupervisor, SupervisorCommand, SupervisorHandle,
};
