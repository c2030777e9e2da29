//! Wire types for the Collective Insights detections endpoint.
//!
//! Requests borrow the batch they describe so a lane never copies its
//! records to build a payload. Responses are parsed leniently: every field is
//! optional and unknown fields are ignored.

use serde::{Deserialize, Serialize};

/// One detection of an indicator of compromise, as produced by the record
/// source. `transient_id` is only used to correlate per-item response status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub ioc: Ioc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident: Option<Incident>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitre_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malwares: Option<Vec<String>>,
    pub detection: Detection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient_id: Option<String>,
}

impl DetectionRecord {
    /// Minimal record with just an indicator and a detection type.
    pub fn new(
        ioc_type: impl Into<String>,
        ioc_value: impl Into<String>,
        detection_type: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: None,
            ioc: Ioc {
                ioc_type: ioc_type.into(),
                value: ioc_value.into(),
                source_type: None,
                field: None,
            },
            incident: None,
            mitre_codes: None,
            malwares: None,
            detection: Detection {
                detection_type: detection_type.into(),
                sub_type: None,
                id: None,
                name: None,
            },
            transient_id: None,
        }
    }

    pub fn with_transient_id(mut self, id: impl Into<String>) -> Self {
        self.transient_id = Some(id.into());
        self
    }
}

/// Indicator of compromise. `ioc_type` is serialized as `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ioc {
    #[serde(rename = "type")]
    pub ioc_type: String,
    pub value: String,
    /// Log source where the detection was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Log or event field containing the indicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub incident_type: Option<String>,
}

/// How the indicator was detected. `sub_type` is mandatory when
/// `detection_type` is `"detection_rule"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "type")]
    pub detection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Call-level flags sent with every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiOptions {
    /// When set, submissions are not saved by the remote side.
    pub debug: bool,
    /// When set, the response includes a per-item summary.
    pub summary: bool,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            debug: false,
            summary: true,
        }
    }
}

/// Options shared by every batch of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    pub api: ApiOptions,
    /// Organization scoping; omitted from the wire when empty.
    pub organization_ids: Vec<String>,
}

impl SubmitOptions {
    pub fn debug(mut self, debug: bool) -> Self {
        self.api.debug = debug;
        self
    }

    pub fn summary(mut self, summary: bool) -> Self {
        self.api.summary = summary;
        self
    }

    pub fn organization_ids(mut self, ids: Vec<String>) -> Self {
        self.organization_ids = ids;
        self
    }
}

/// Body of one POST to the detections endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRequest<'a> {
    pub options: ApiOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_ids: Option<&'a [String]>,
    pub data: &'a [DetectionRecord],
}

impl<'a> SubmissionRequest<'a> {
    pub fn new(records: &'a [DetectionRecord], options: &'a SubmitOptions) -> Self {
        Self {
            options: options.api,
            organization_ids: (!options.organization_ids.is_empty())
                .then_some(options.organization_ids.as_slice()),
            data: records,
        }
    }
}

/// Parsed response of a successful call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmissionResponse {
    #[serde(default)]
    pub summary: Option<ResponseSummary>,
    #[serde(default, alias = "data", alias = "results")]
    pub items: Vec<ItemStatus>,
}

impl SubmissionResponse {
    /// Parse a response body, falling back to an empty response when the
    /// body is blank or not the expected JSON shape.
    pub fn parse_lenient(body: &str) -> Self {
        if body.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Could not parse API response, treating as empty");
                Self::default()
            }
        }
    }
}

/// Counters reported by the API for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSummary {
    #[serde(default)]
    pub submitted: u64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub dropped: u64,
}

/// Status the API reported for a single submitted item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ItemStatus {
    #[serde(default)]
    pub transient_id: Option<String>,
    #[serde(default)]
    pub status: ItemState,
    #[serde(default, alias = "message", alias = "error")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    #[serde(alias = "processed", alias = "ok", alias = "success")]
    Accepted,
    #[serde(alias = "invalid", alias = "error", alias = "failed")]
    Rejected,
    Dropped,
    #[default]
    #[serde(other)]
    Unknown,
}
