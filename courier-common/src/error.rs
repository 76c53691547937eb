//! Error taxonomy for the routing-graph build pipeline.
//!
//! Four failure classes exist, and callers are expected to react to them
//! differently: a `DataAccess` failure aborts the whole run, a
//! `Validation` failure aborts with a human-readable cause, an
//! `ExternalTool` failure is fatal to the affected build variant only,
//! and `Container` failures concern the serving layer, never a build.
//! Waiting on another build's completion is not a failure and has no
//! representation here.

use thiserror::Error;

/// Upper bound for error messages persisted into a build record.
///
/// Compiler stage output can run to tens of megabytes; anything stored
/// durably is truncated to this length first.
pub const MAX_ERROR_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Error)]
pub enum GraphError {
    /// The relational store is unreachable or a query failed.
    ///
    /// Distinct from a query that succeeded with zero rows, which is
    /// either a valid result or a `Validation` condition.
    #[error("data access failure: {0}")]
    DataAccess(String),

    /// Required input is missing or structurally unusable.
    #[error("validation failure: {0}")]
    Validation(String),

    /// An external compiler stage exited non-zero or overran its deadline.
    #[error("stage '{stage}' failed (exit code {code:?}): {output}")]
    ExternalTool {
        stage: String,
        code: Option<i32>,
        output: String,
    },

    /// The container runtime rejected a lifecycle operation.
    #[error("container runtime failure: {0}")]
    Container(String),

    /// A build-record status transition that the state machine forbids.
    #[error("invalid build state transition: {0}")]
    State(String),
}

impl GraphError {
    /// Construct an `ExternalTool` error with the captured output already
    /// truncated to the storable bound.
    pub fn external_tool(stage: impl Into<String>, code: Option<i32>, output: &str) -> Self {
        GraphError::ExternalTool {
            stage: stage.into(),
            code,
            output: truncate_message(output),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Truncate a message to [`MAX_ERROR_MESSAGE_LEN`], respecting char
/// boundaries. The tail is dropped rather than the head: the first lines
/// of compiler output name the failing input, the rest is usually noise.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [truncated]", &message[..end])
}
