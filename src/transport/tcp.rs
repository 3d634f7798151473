use super::{Connection, Dialer};
use crate::error::{Result, TransportError};
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JsonRpcV2Message};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};

const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1MB

/// Dials plugins that speak newline-delimited JSON-RPC over TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{address}: {e}")))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }

        Ok(Arc::new(TcpConnection::new(address.to_string(), stream)))
    }
}

pub struct TcpConnection {
    address: String,
    framed: Mutex<Framed<TcpStream, LinesCodec>>,
    closed: Arc<AtomicBool>,
}

impl TcpConnection {
    pub fn new(address: String, stream: TcpStream) -> Self {
        Self {
            address,
            framed: Mutex::new(Framed::new(
                stream,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn call(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let expected_id = request.id.clone();
        let line = serde_json::to_string(&request.into_message())
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;

        // Holding the stream for the whole exchange keeps request/response pairs aligned.
        let mut framed = self.framed.lock().await;

        if let Err(e) = framed.send(line).await {
            self.mark_closed();
            return Err(TransportError::SendFailed(e.to_string()).into());
        }

        loop {
            let line = match framed.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(TransportError::ReceiveFailed(e.to_string()).into());
                }
                None => {
                    self.mark_closed();
                    return Err(TransportError::Closed.into());
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: JsonRpcMessage = serde_json::from_str(trimmed)
                .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;

            match message {
                JsonRpcMessage::V2(JsonRpcV2Message::Response(resp)) if resp.id == expected_id => {
                    return Ok(resp);
                }
                JsonRpcMessage::V2(JsonRpcV2Message::Notification(notification)) => {
                    tracing::trace!(
                        "Ignoring notification {} from {}",
                        notification.method,
                        self.address
                    );
                }
                JsonRpcMessage::V2(JsonRpcV2Message::Response(resp)) => {
                    // Late answer to an exchange abandoned by a timeout or cancellation
                    tracing::debug!(
                        "Discarding stale response {} from {} (waiting for {})",
                        resp.id,
                        self.address,
                        expected_id
                    );
                }
                JsonRpcMessage::V2(JsonRpcV2Message::Request(req)) => {
                    return Err(TransportError::InvalidFormat(format!(
                        "unexpected request '{}' from plugin",
                        req.method
                    ))
                    .into());
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut framed = self.framed.lock().await;
        SinkExt::<String>::close(&mut *framed)
            .await
            .map_err(|e| TransportError::SendFailed(format!("close {}: {e}", self.address)))?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
