//! Tool output envelope.
//!
//! Handlers return `{ok, data}` or `{ok, error}`; the JSON form is what the
//! model sees as tool result text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::{ContentBlock, ToolCall, ToolResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Success {
        data: Value,
        /// Extra blocks (images, documents) sent after the JSON envelope.
        attachments: Vec<ContentBlock>,
    },
    Failure {
        error: ToolError,
    },
    /// Aborted before settling. Serializes as a failure with code `canceled`.
    Canceled {
        message: String,
    },
}

const CANCELED_ERROR_CODE: &str = "canceled";

impl Serialize for ToolOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ToolOutput", 2)?;
        match self {
            ToolOutput::Success { data, .. } => {
                state.serialize_field("ok", &true)?;
                state.serialize_field("data", data)?;
            }
            ToolOutput::Failure { error } => {
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", error)?;
            }
            ToolOutput::Canceled { message } => {
                let error = ToolError {
                    code: CANCELED_ERROR_CODE.to_string(),
                    message: message.clone(),
                    details: None,
                };
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", &error)?;
            }
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawToolOutput {
            ok: bool,
            #[serde(default)]
            data: Option<Value>,
            #[serde(default)]
            error: Option<ToolError>,
        }

        let raw = RawToolOutput::deserialize(deserializer)?;
        Ok(match (raw.ok, raw.error) {
            (true, _) => ToolOutput::success(raw.data.unwrap_or(Value::Null)),
            (false, Some(error)) if error.code == CANCELED_ERROR_CODE => ToolOutput::Canceled {
                message: error.message,
            },
            (false, Some(error)) => ToolOutput::Failure { error },
            (false, None) => ToolOutput::failure("unknown", "Unknown error", None),
        })
    }
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        ToolOutput::Success {
            data,
            attachments: Vec::new(),
        }
    }

    pub fn success_with_attachments(data: Value, attachments: Vec<ContentBlock>) -> Self {
        ToolOutput::Success { data, attachments }
    }

    pub fn failure(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        ToolOutput::Failure {
            error: ToolError {
                code: code.into(),
                message: message.into(),
                details,
            },
        }
    }

    pub fn failure_with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self::failure(code, message, Some(details.into()))
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        ToolOutput::Canceled {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { data, .. } => Some(data),
            ToolOutput::Failure { .. } | ToolOutput::Canceled { .. } => None,
        }
    }

    /// Error code for failures, `canceled` for canceled outputs.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ToolOutput::Success { .. } => None,
            ToolOutput::Failure { error } => Some(&error.code),
            ToolOutput::Canceled { .. } => Some(CANCELED_ERROR_CODE),
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"code":"serialize_error","message":"Failed to serialize tool output"}}"#.to_string()
        })
    }

    /// Wraps the envelope into the result for `call`.
    pub fn into_result(self, call: &ToolCall) -> ToolResult {
        let is_error = !self.is_ok();
        let mut content = vec![ContentBlock::text(self.to_json_string())];
        if let ToolOutput::Success { attachments, .. } = self {
            content.extend(attachments);
        }
        ToolResult {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        }
    }
}

/// Error details for a failed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_shapes() {
        assert_eq!(
            ToolOutput::success(json!(4)).to_json_string(),
            r#"{"ok":true,"data":4}"#
        );
        assert_eq!(
            ToolOutput::failure("timeout", "too slow", None).to_json_string(),
            r#"{"ok":false,"error":{"code":"timeout","message":"too slow"}}"#
        );
        assert_eq!(
            ToolOutput::canceled("stop").to_json_string(),
            r#"{"ok":false,"error":{"code":"canceled","message":"stop"}}"#
        );
    }

    #[test]
    fn test_canceled_round_trips_through_code() {
        let parsed: ToolOutput =
            serde_json::from_str(r#"{"ok":false,"error":{"code":"canceled","message":"x"}}"#)
                .unwrap();
        assert_eq!(parsed, ToolOutput::canceled("x"));
        let parsed: ToolOutput = serde_json::from_str(r#"{"ok":false}"#).unwrap();
        assert_eq!(parsed.error_code(), Some("unknown"));
    }

    #[test]
    fn test_into_result_flags_errors() {
        let call = ToolCall::new("t1", "calc", json!({}));
        let ok = ToolOutput::success(json!(4)).into_result(&call);
        assert!(!ok.is_error);
        assert_eq!(ok.tool_use_id, "t1");
        let failed = ToolOutput::failure("bad_input", "nope", None).into_result(&call);
        assert!(failed.is_error);
        assert_eq!(failed.name, "calc");
    }
}
