use gatekeeper_core::duration::format_hms;
use serde_json::{json, Value};
use std::backtrace::Backtrace;
use std::time::Duration;

use crate::templates::{escape_markdown, TemplateKind};

/// Infrastructure failures that stop a review.
///
/// Each variant maps onto one comment template; the captured stack is
/// rendered into the comment so failures can be traced without log access.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("{step} failed: {error:#}")]
    Api {
        step: &'static str,
        error: anyhow::Error,
        stack: String,
    },

    #[error("pull request is not mergeable: {error:#}")]
    NotMergeable { error: anyhow::Error, stack: String },

    #[error("gave up waiting for {name} after {attempts} attempts")]
    RetryExceeded {
        name: String,
        attempts: u32,
        elapsed: Duration,
        stack: String,
    },

    #[error("status checks failed: {message}")]
    StatusCheckFailed { message: String, stack: String },
}

fn capture_stack() -> String {
    Backtrace::force_capture().to_string()
}

impl ReviewError {
    pub fn api(step: &'static str, error: anyhow::Error) -> Self {
        ReviewError::Api {
            step,
            error,
            stack: capture_stack(),
        }
    }

    pub fn not_mergeable(error: anyhow::Error) -> Self {
        ReviewError::NotMergeable {
            error,
            stack: capture_stack(),
        }
    }

    pub fn retry_exceeded(name: impl Into<String>, attempts: u32, elapsed: Duration) -> Self {
        ReviewError::RetryExceeded {
            name: name.into(),
            attempts,
            elapsed,
            stack: capture_stack(),
        }
    }

    pub fn status_check_failed(message: impl Into<String>) -> Self {
        ReviewError::StatusCheckFailed {
            message: message.into(),
            stack: capture_stack(),
        }
    }

    pub fn template_kind(&self) -> TemplateKind {
        match self {
            ReviewError::Api { .. } => TemplateKind::GeneralApiError,
            ReviewError::NotMergeable { .. } => TemplateKind::NotMergeable,
            ReviewError::RetryExceeded { .. } => TemplateKind::RetryExceeded,
            ReviewError::StatusCheckFailed { .. } => TemplateKind::StatusCheckFailed,
        }
    }

    pub fn stack(&self) -> &str {
        match self {
            ReviewError::Api { stack, .. }
            | ReviewError::NotMergeable { stack, .. }
            | ReviewError::RetryExceeded { stack, .. }
            | ReviewError::StatusCheckFailed { stack, .. } => stack,
        }
    }

    /// Values for this error's template.
    pub fn template_data(&self, log_url: &str) -> Value {
        let mut data = json!({
            "stack": self.stack(),
            "log_url": log_url,
        });
        let extra = match self {
            ReviewError::Api { step, error, .. } => json!({
                "step": escape_markdown(step),
                "error": format!("{:#}", error),
            }),
            ReviewError::NotMergeable { error, .. } => json!({
                "error": format!("{:#}", error),
            }),
            ReviewError::RetryExceeded {
                name,
                attempts,
                elapsed,
                ..
            } => json!({
                "name": escape_markdown(name),
                "attempts": attempts,
                "elapsed": format_hms(*elapsed),
            }),
            ReviewError::StatusCheckFailed { message, .. } => json!({
                "message": escape_markdown(message),
            }),
        };
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            data.extend(extra);
        }
        data
    }
}
