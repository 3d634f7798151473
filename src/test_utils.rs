use crate::descriptor::{Capabilities, PluginDescriptor};
use crate::error::{Result, TransportError};
use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Connection, Dialer};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn descriptor(name: &str) -> PluginDescriptor {
    PluginDescriptor {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        providers: None,
        rpc_address: format!("{name}.plugins.test:50051"),
        capabilities: Capabilities {
            supports_projected_cost: true,
            ..Capabilities::default()
        },
        path: PathBuf::from(format!("/plugins/{name}")),
    }
}

/// How a scripted connection answers calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    Serving,
    NotServing,
    RpcError,
    /// Never answers
    Hang,
    /// Peer hangs up; the channel reports closed afterwards
    Disconnect,
    /// Answers SERVING, but `close()` fails
    FailClose,
}

pub struct ScriptedConnection {
    behavior: Mutex<ProbeBehavior>,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedConnection {
    pub fn new(behavior: ProbeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_behavior(&self, behavior: ProbeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn call(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            ProbeBehavior::Serving | ProbeBehavior::FailClose => Ok(JsonRpcResponse {
                id: request.id,
                result: Some(json!({ "status": "SERVING" })),
                error: None,
            }),
            ProbeBehavior::NotServing => Ok(JsonRpcResponse {
                id: request.id,
                result: Some(json!({ "status": "NOT_SERVING" })),
                error: None,
            }),
            ProbeBehavior::RpcError => Ok(JsonRpcResponse {
                id: request.id,
                result: None,
                error: Some(JsonRpcError {
                    code: -32601,
                    message: "Method not found".to_string(),
                    data: None,
                }),
            }),
            ProbeBehavior::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            ProbeBehavior::Disconnect => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::Closed.into())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if *self.behavior.lock().unwrap() == ProbeBehavior::FailClose {
            return Err(TransportError::SendFailed("close failed".to_string()).into());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Dialer that counts attempts and hands out scripted connections
pub struct ScriptedDialer {
    dials: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
    behavior: Mutex<ProbeBehavior>,
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
}

impl Default for ScriptedDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDialer {
    pub fn new() -> Self {
        Self {
            dials: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            behavior: Mutex::new(ProbeBehavior::Serving),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self) -> Self {
        self.set_failing(true);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Behavior for connections dialed from now on
    pub fn set_behavior(&self, behavior: ProbeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn last_connection(&self) -> Option<Arc<ScriptedConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(
                TransportError::ConnectionFailed(format!("{address}: connection refused")).into(),
            );
        }

        let behavior = *self.behavior.lock().unwrap();
        let conn = Arc::new(ScriptedConnection::new(behavior));
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
