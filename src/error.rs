//! Error taxonomy for the agent.
//!
//! Gateway errors are answered synchronously to the HTTP caller. Scan and
//! delivery errors happen inside background job tasks and only ever reach
//! the logs and the job's terminal status.

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Rejections produced while admitting an inbound scan request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("unauthorized")]
    Unauthorized,

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("malformed query string")]
    MalformedQuery,

    #[error("invalid options: {0}")]
    InvalidOptions(#[from] OptionsError),

    #[error("scan job already running")]
    Conflict(#[from] ConflictError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::MissingParameter(_)
            | GatewayError::MalformedQuery
            | GatewayError::InvalidOptions(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

/// A job with the same identifier is already registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {jid} is already running")]
pub struct ConflictError {
    pub jid: String,
}

/// Reasons an option string cannot be handed to the scanner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    #[error("no targets or flags given")]
    Empty,

    #[error("token {0:?} contains control characters")]
    ControlCharacter(String),

    #[error("flag {0:?} is reserved by the agent")]
    ReservedFlag(String),
}

/// Failures of a single scanner invocation. None of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("scanner exited unsuccessfully ({status})")]
    Exit { status: std::process::ExitStatus },

    #[error("scanner did not finish within {0:?}")]
    Timeout(Duration),

    #[error("failed to read scan output {}: {source}", path.display())]
    ReadOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed scan output {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },
}

impl ScanError {
    /// True for failures that happened after the scanner exited cleanly.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, ScanError::ReadOutput { .. } | ScanError::Parse { .. })
    }
}

/// What went wrong on one delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure {
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to build request: {0}")]
    Request(#[source] reqwest::Error),

    #[error("results rejected by server with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("all {attempts} delivery attempts failed, last: {last}")]
    Exhausted { attempts: u32, last: AttemptFailure },
}

/// Terminal failure of a job after admission.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
