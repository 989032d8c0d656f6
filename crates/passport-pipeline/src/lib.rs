//! passport-pipeline — job orchestration for the passport photo engine.
//!
//! [`Orchestrator`] is the pure state machine; [`spawn_session`] runs it on
//! tokio, with analysis on the blocking pool and segmentation on its own
//! thread.

pub mod config;
pub mod job;
pub mod orchestrator;
pub mod session;
mod worker;

pub use config::{Config, ConfigError};
pub use job::{MaskState, PhotoJob};
pub use orchestrator::{
    CommandError, Notice, Orchestrator, PipelineState, Snapshot, StageStatus, TaskStatus,
};
pub use session::{spawn_session, SessionError, SessionHandle, SessionOptions};
