//! Concurrent batch submission of detection records to the Recorded Future
//! Collective Insights API.

pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod input;
pub mod ui;

pub use api::{DetectionClient, DetectionRecord, SubmitOptions, Transport};
pub use engine::{
    BatchResult, EngineConfig, ProcessingSummary, RecordStatus, SubmissionEngine,
    submit_detections,
};
pub use error::{BatchFailure, FailureKind, SubmitError};
