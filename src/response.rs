use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DataKeepError, ErrorType};

/// Result envelope returned from every facade operation.
///
/// `error_type == ErrorType::None` signals success; business failures carry
/// their kind and a human-readable message instead of propagating as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub error_type: ErrorType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self {
            error_type: ErrorType::None,
            message: String::new(),
            payload: Some(payload),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            error_type: ErrorType::None,
            message: String::new(),
            payload: None,
        }
    }

    pub fn from_error(err: &DataKeepError) -> Self {
        Self {
            error_type: err.error_type(),
            message: err.to_string(),
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_type == ErrorType::None
    }
}
