pub mod client;
pub mod error;
pub mod types;

pub use client::{API_URL, DetectionClient, RawResponse, Transport};
pub use error::TransportError;
pub use types::{
    ApiOptions, Detection, DetectionRecord, Incident, Ioc, ItemState, ItemStatus,
    ResponseSummary, SubmissionRequest, SubmissionResponse, SubmitOptions,
};
