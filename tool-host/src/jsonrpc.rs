//! JSON-RPC 2.0 framing shared by both transports.

use common::error::RagError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: VERSION,
            id,
            method,
            params,
        }
    }
}

/// Incoming frame: a response (`id` + `result`/`error`) or a notification
/// (`method` + `params`).
#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Message {
    pub fn response_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ErrorBody {
    /// An adapter marks an error retryable via `data.retryable`; absent
    /// that, the implementation-defined server-error range is assumed
    /// transient.
    pub fn retryable(&self) -> bool {
        if let Some(flag) = self
            .data
            .as_ref()
            .and_then(|d| d.get("retryable"))
            .and_then(Value::as_bool)
        {
            return flag;
        }
        (-32099..=-32000).contains(&self.code)
    }

    pub fn into_error(self) -> RagError {
        let retryable = self.retryable();
        RagError::Rpc {
            code: self.code,
            message: self.message,
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_carry_version_and_id() {
        let req = Request::new(7, "mcp.ping", json!({}));
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "mcp.ping");
    }

    #[test]
    fn response_and_notification_frames_parse() {
        let response: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert_eq!(response.response_id(), Some(3));
        assert!(response.error.is_none());

        let notification: Message =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"mcp.event","params":{}}"#).unwrap();
        assert!(notification.response_id().is_none());
        assert_eq!(notification.method.as_deref(), Some("mcp.event"));
    }

    #[test]
    fn retryability_follows_data_flag_then_code_range() {
        let explicit = ErrorBody {
            code: -32600,
            message: "invalid".into(),
            data: Some(json!({"retryable": true})),
        };
        assert!(explicit.retryable());

        let server_error = ErrorBody {
            code: -32000,
            message: "busy".into(),
            data: None,
        };
        assert!(server_error.retryable());

        let invalid_request = ErrorBody {
            code: -32600,
            message: "invalid".into(),
            data: None,
        };
        assert!(!invalid_request.retryable());
    }

    #[test]
    fn error_body_maps_to_rpc_kind() {
        let err = ErrorBody {
            code: -32001,
            message: "overloaded".into(),
            data: None,
        }
        .into_error();
        match err {
            RagError::Rpc {
                code,
                retryable,
                ..
            } => {
                assert_eq!(code, -32001);
                assert!(retryable);
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }
}
