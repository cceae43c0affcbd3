//! Shared JSON output schema types for flux-ingest.
//!
//! All stdout output is JSON only. Tracing logs go to stderr.
//! Schema version is fixed at "1".

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION: &str = "1";

/// Serialize `value` to a JSON string and print it as a single line to
/// stdout. The single place where stdout JSON output is written, so the
/// stdout-is-JSON-only contract is enforced uniformly across response types.
fn print_json_to_stdout(value: &impl Serialize) {
    println!(
        "{}",
        serde_json::to_string(value).expect("JSON serialization failed")
    );
}

/// Top-level envelope used for every successful response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<T: Serialize> {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn new(kind: &'static str, data: T) -> Self {
        Response {
            schema_version: SCHEMA_VERSION,
            ok: true,
            kind,
            data,
        }
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

/// Top-level envelope for error responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub schema_version: &'static str,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ErrorResponse {
            schema_version: SCHEMA_VERSION,
            ok: false,
            kind: "error",
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                retryable,
            },
        }
    }

    /// Build an error response from a `FluxError`, reusing its errno-class
    /// code and retryability (spec §7).
    pub fn from_flux_error(e: &crate::error::FluxError) -> Self {
        ErrorResponse::new(e.code(), e.to_string(), e.retryable())
    }

    pub fn print(&self) {
        print_json_to_stdout(self);
    }
}

// ---------- Command-specific response payloads ----------

/// Response for `submit`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitData {
    /// Dotted-decimal FLUID (`<timestamp_ms>.<generator_id>.<sequence>`).
    pub job_id: String,
    /// Base-58 compact display form of the same id.
    pub job_id_f58: String,
    pub state: String,
}

/// Response for `status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusData {
    pub job_id: String,
    pub state: String,
    pub urgency: i32,
    pub t_submit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<String>,
}

/// Summary of a single job, included in `list` responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub state: String,
    pub urgency: i32,
    pub t_submit: f64,
}

/// Response for `list`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListData {
    pub root: String,
    pub jobs: Vec<JobSummary>,
    pub truncated: bool,
}

/// Response for `cancel`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelData {
    pub job_id: String,
}

/// Response for `attach` (printed once, after the attach session ends).
#[derive(Debug, Serialize, Deserialize)]
pub struct AttachData {
    pub job_id: String,
    pub exit_code: i32,
}

/// Response for `schema`: the embedded jobspec v1 JSON Schema document.
#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaData {
    pub schema: Value,
}
