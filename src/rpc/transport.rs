//! JSON-RPC transport seam
//!
//! The pool only knows about [`RpcTransport`]; production uses
//! [`HttpTransport`] (JSON-RPC 2.0 over reqwest), tests plug in scripted
//! transports.

use super::errors::RpcError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send one JSON-RPC request to `endpoint` and return the `result` member.
    async fn send(&self, endpoint: &str, method: &str, params: &Value) -> Result<Value, RpcError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    /// `request_timeout` is a transport-level ceiling; the pool applies its own
    /// per-call timeout on top.
    pub fn new(request_timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(30))
            .user_agent(concat!("flowgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, endpoint: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.client.post(endpoint).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RpcError::from_http_status(status.as_u16(), &text));
        }

        let payload: Value = response.json().await?;
        extract_result(payload)
    }
}

/// Pull `result` out of a JSON-RPC response, mapping `error` objects.
pub fn extract_result(mut payload: Value) -> Result<Value, RpcError> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(RpcError::from_rpc_error(code, message));
    }

    match payload.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::InvalidResponse(
            "response has neither result nor error".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_result_ok() {
        let payload = json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"});
        assert_eq!(extract_result(payload).unwrap(), json!("0x10"));
    }

    #[test]
    fn test_extract_result_null_result_is_ok() {
        // eth_getBlockByNumber returns null for unknown blocks
        let payload = json!({"jsonrpc": "2.0", "id": 1, "result": null});
        assert_eq!(extract_result(payload).unwrap(), Value::Null);
    }

    #[test]
    fn test_extract_result_maps_error() {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32005, "message": "query returned more than 10000 results"}
        });
        assert!(extract_result(payload).unwrap_err().is_too_many_results());
    }

    #[test]
    fn test_extract_result_missing_both() {
        let payload = json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(extract_result(payload), Err(RpcError::InvalidResponse(_))));
    }
}
