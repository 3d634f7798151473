#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// How the stub plugin treats incoming connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    Serving,
    NotServing,
    /// Accept, then close without answering
    HangUp,
}

/// A cost plugin stand-in speaking newline-delimited JSON-RPC over TCP
pub struct StubPlugin {
    pub address: String,
    accepts: Arc<AtomicUsize>,
    mode: Arc<Mutex<StubMode>>,
}

impl StubPlugin {
    pub async fn start(mode: StubMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepts = Arc::new(AtomicUsize::new(0));
        let mode = Arc::new(Mutex::new(mode));

        let accepted = accepts.clone();
        let current = mode.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let current = current.clone();
                tokio::spawn(async move {
                    if *current.lock().unwrap() == StubMode::HangUp {
                        return;
                    }
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let status = match *current.lock().unwrap() {
                            StubMode::Serving => "SERVING",
                            StubMode::NotServing => "NOT_SERVING",
                            StubMode::HangUp => return,
                        };
                        let request: serde_json::Value = serde_json::from_str(&line).unwrap();
                        let response = serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": request["id"],
                            "result": { "status": status }
                        });
                        let out = format!("{response}\n");
                        if write.write_all(out.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            address,
            accepts,
            mode,
        }
    }

    pub fn set_mode(&self, mode: StubMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Number of TCP connections the stub has accepted
    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// Address with nothing listening on it
pub async fn unreachable_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

pub fn write_descriptor(root: &Path, name: &str, address: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    let descriptor = serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "description": format!("{name} pricing"),
        "providers": "aws",
        "grpc_address": address,
        "capabilities": { "supports_projected_cost": true }
    });
    fs::write(dir.join("plugin.json"), descriptor.to_string()).unwrap();
}
