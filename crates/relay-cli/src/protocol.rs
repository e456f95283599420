//! Wire types shared by the HTTP surface and the worker transport.
//!
//! Worker processes speak newline-delimited JSON over stdio. Every message
//! is an object tagged by `type`.
//!
//! ```text
//! parent -> worker   {"type":"build","id":1,"options":{...}}
//! worker -> parent   {"type":"build","id":1,"buildHash":"...","buildData":{"error":null,"data":{...}}}
//! ```

use relay_core::{BuildOptions, BuildResult, ContextStatus, Error};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::hmr::HmrEvent;

/// Request sent from the server to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ParentMessage {
    /// Build with fully resolved options.
    Build { id: u64, options: BuildOptions },
    /// Report the worker's context status.
    Status { id: u64 },
}

/// Message sent from a worker to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// The worker is up and reading requests.
    Ready { pid: u32 },
    Status { id: u64, status: ContextStatus },
    Build {
        id: u64,
        build_hash: String,
        build_data: BuildData,
    },
    /// A build was answered from the persistent cache.
    Cache { build_hash: String },
    /// The worker started forwarding HMR events for a namespace.
    HmrRegister { namespace: String },
    HmrDone { namespace: String, payload: HmrEvent },
    HmrInvalid { namespace: String },
}

/// Body of a build response: `{error, data}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildData {
    pub error: Option<ErrorPayload>,
    pub data: Option<serde_json::Value>,
}

/// Serialized error with ANSI color codes removed from every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(kind: &str, message: &str, stack: Option<String>) -> Self {
        Self {
            kind: strip_ansi(kind),
            message: strip_ansi(message),
            stack: stack.as_deref().map(strip_ansi),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::new(err.kind(), &err.to_string(), error_chain(err))
    }

    pub fn from_worker_error(err: &WorkerError) -> Self {
        Self::new(err.kind(), &err.to_string(), None)
    }
}

impl BuildData {
    /// Serialize a build result. A compile error keeps the output that was
    /// produced alongside it.
    pub fn from_result(result: &BuildResult) -> Self {
        match result {
            Ok(output) => match serde_json::to_value(output.as_ref()) {
                Ok(data) => Self {
                    error: None,
                    data: Some(data),
                },
                Err(e) => Self::from_error(&Error::from(e)),
            },
            Err(err) => Self {
                error: Some(ErrorPayload::from_error(err)),
                data: err
                    .output()
                    .and_then(|output| serde_json::to_value(output.as_ref()).ok()),
            },
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            error: Some(ErrorPayload::from_error(err)),
            data: None,
        }
    }

    pub fn from_worker_error(err: &WorkerError) -> Self {
        Self {
            error: Some(ErrorPayload::from_worker_error(err)),
            data: None,
        }
    }

    /// A request the server could not even parse.
    pub fn bad_request(message: &str) -> Self {
        Self {
            error: Some(ErrorPayload::new("RequestError", message, None)),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub fn strip_ansi(text: &str) -> String {
    console::strip_ansi_codes(text).into_owned()
}

/// The error and its sources, one per line.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut lines = vec![format!("{err}")];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("    caused by: {cause}"));
        source = cause.source();
    }
    Some(lines.join("\n"))
}
