//! Reads the detections file given on the command line.

use std::path::Path;

use serde::Deserialize;

use crate::api::DetectionRecord;
use crate::error::SubmitError;

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordsFile {
    Bare(Vec<DetectionRecord>),
    Wrapped { data: Vec<DetectionRecord> },
}

/// Parse a JSON array of records, or an object holding them under `data`.
pub fn parse_records(json: &str) -> Result<Vec<DetectionRecord>, SubmitError> {
    let records = match serde_json::from_str::<RecordsFile>(json) {
        Ok(RecordsFile::Bare(records)) | Ok(RecordsFile::Wrapped { data: records }) => records,
        // Re-parse as a bare array for a precise error location.
        Err(_) => serde_json::from_str::<Vec<DetectionRecord>>(json)?,
    };
    Ok(records)
}

pub fn read_records(path: &Path) -> Result<Vec<DetectionRecord>, SubmitError> {
    let contents = std::fs::read_to_string(path)?;
    parse_records(&contents)
}
