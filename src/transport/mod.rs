use crate::error::Result;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::sync::Arc;

pub mod pool;
pub mod tcp;

pub use pool::ConnectionManager;
pub use tcp::{TcpConnection, TcpDialer};

/// Opens RPC channels to plugin endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>>;
}

/// An established channel to one plugin.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one request and wait for its response. Exchanges on a single
    /// channel never interleave.
    async fn call(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;
    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}
