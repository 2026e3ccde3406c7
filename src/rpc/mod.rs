//! JSON-RPC access to the chain through a health-scored provider pool

pub mod errors;
pub mod pool;
pub mod transport;
pub mod types;

pub use errors::RpcError;
pub use pool::{ProviderEndpoint, ProviderPool, ProviderPoolConfig, ProviderState};
pub use transport::{HttpTransport, RpcTransport};
