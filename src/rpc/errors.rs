use thiserror::Error;

/// Errors surfaced by the provider pool and its transports.
///
/// Classification drives failover:
/// - rate limits force an immediate switch to the next provider
/// - `TooManyResults` is the caller's problem (shrink the block range), not the provider's
/// - client errors (bad params) are returned as-is without touching provider health
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("HTTP error {0}: {1}")]
    Http(u16, String),

    #[error("RPC error {0}: {1}")]
    Rpc(i64, String),

    /// The node refused to answer because the result set is too large.
    /// Message is passed through verbatim.
    #[error("{0}")]
    TooManyResults(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("no RPC providers configured")]
    NoProviders,
}

impl RpcError {
    /// Build the right variant for a JSON-RPC `error` object.
    pub fn from_rpc_error(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("too many results")
            || lower.contains("query returned more than")
            || lower.contains("block range")
            || lower.contains("response size exceeded")
        {
            RpcError::TooManyResults(message.to_string())
        } else if code == -32005 || lower.contains("rate limit") || lower.contains("too many requests") {
            RpcError::RateLimited(message.to_string())
        } else {
            RpcError::Rpc(code, message.to_string())
        }
    }

    pub fn from_http_status(status: u16, body: &str) -> Self {
        if status == 429 {
            RpcError::RateLimited(format!("HTTP 429: {}", truncate(body, 200)))
        } else {
            RpcError::Http(status, truncate(body, 200).to_string())
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RpcError::RateLimited(_))
    }

    pub fn is_too_many_results(&self) -> bool {
        matches!(self, RpcError::TooManyResults(_))
    }

    /// Invalid request / method not found / invalid params: the caller's fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RpcError::Rpc(code, _) if (-32602..=-32600).contains(code))
    }

    /// Whether this error should cost the provider health.
    pub fn penalizes_provider(&self) -> bool {
        !self.is_too_many_results() && !self.is_client_error()
    }

    /// Worth retrying on the same or another provider.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Timeout(_) | RpcError::RateLimited(_) | RpcError::Transport(_) => true,
            RpcError::Http(status, _) => *status >= 500,
            RpcError::Rpc(..) => !self.is_client_error(),
            RpcError::InvalidResponse(_) => true,
            RpcError::TooManyResults(_) | RpcError::Exhausted { .. } | RpcError::NoProviders => false,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_too_many_results() {
        let err = RpcError::from_rpc_error(-32005, "query returned more than 10000 results");
        assert!(err.is_too_many_results());
        assert!(!err.penalizes_provider());
        assert!(!err.is_transient());
        // Message surfaces verbatim
        assert_eq!(err.to_string(), "query returned more than 10000 results");
    }

    #[test]
    fn test_classifies_rate_limits() {
        assert!(RpcError::from_rpc_error(-32005, "limit exceeded").is_rate_limit());
        assert!(RpcError::from_rpc_error(-32000, "Rate limit reached").is_rate_limit());
        assert!(RpcError::from_http_status(429, "slow down").is_rate_limit());
        assert!(!RpcError::from_http_status(503, "unavailable").is_rate_limit());
    }

    #[test]
    fn test_client_errors_do_not_penalize() {
        let err = RpcError::from_rpc_error(-32602, "invalid params");
        assert!(err.is_client_error());
        assert!(!err.penalizes_provider());

        let err = RpcError::from_rpc_error(-32603, "internal error");
        assert!(!err.is_client_error());
        assert!(err.penalizes_provider());
        assert!(err.is_transient());
    }
}
