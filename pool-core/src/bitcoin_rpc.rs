use crate::{Result, Error};
use crate::config::DaemonConfig;
use crate::daemon::{DaemonEvent, DaemonEventReceiver, DaemonEventSender, DaemonInterface};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// JSON-RPC client for a Bitcoin-compatible node
#[derive(Debug, Clone)]
pub struct RpcDaemon {
    config: DaemonConfig,
    client: reqwest::Client,
    events: DaemonEventSender,
    online: Arc<AtomicBool>,
}

/// RPC request structure
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Vec<Value>,
}

/// RPC response structure
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// RPC error structure
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcDaemon {
    /// Create a new RPC daemon and the receiver for its lifecycle events
    pub fn new(config: DaemonConfig) -> Result<(Self, DaemonEventReceiver)> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| Error::Daemon(format!("Failed to create HTTP client: {}", e)))?;

        let (events, events_rx) = mpsc::unbounded_channel();

        let daemon = Self {
            config,
            client,
            events,
            online: Arc::new(AtomicBool::new(false)),
        };

        Ok((daemon, events_rx))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Start probing the node; raises `Online` or `StartFailed` once
    pub fn init(&self) -> tokio::task::JoinHandle<()> {
        let daemon = self.clone();
        tokio::spawn(async move { daemon.probe_until_online().await })
    }

    async fn probe_until_online(&self) {
        let attempts = self.config.connect_attempts.max(1);
        let retry = Duration::from_secs(self.config.retry_interval);

        for attempt in 1..=attempts {
            match self.call_rpc("getblockcount", Vec::new()).await {
                Ok(height) => {
                    info!("Connected to node at {} (height {})", self.config.rpc_url(), height);
                    self.online.store(true, Ordering::SeqCst);
                    let _ = self.events.send(DaemonEvent::Online);
                    return;
                }
                Err(e) => {
                    warn!("Node probe {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        }

        error!("Node at {} did not come online after {} attempts", self.config.rpc_url(), attempts);
        let _ = self.events.send(DaemonEvent::StartFailed);
    }

    /// Make RPC call to the node
    async fn call_rpc(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: Uuid::new_v4().to_string(),
            method,
            params,
        };

        debug!("RPC call {}", method);

        let response = timeout(
            Duration::from_secs(self.config.timeout),
            self.client
                .post(self.config.rpc_url())
                .basic_auth(&self.config.user, Some(&self.config.password))
                .json(&request)
                .send()
        ).await
        .map_err(|_| Error::Network(format!("RPC request {} timed out", method)))?
        .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await
            .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;

        // The node reports RPC errors with non-2xx statuses, so decode the body first
        let rpc_response: RpcResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(Error::Daemon(format!("Failed to parse JSON response: {}", e)));
            }
            Err(_) => {
                return Err(Error::Network(format!("HTTP error {}: {}", status, body)));
            }
        };

        if let Some(error) = rpc_response.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        if !status.is_success() {
            return Err(Error::Network(format!("HTTP error {}: {}", status, body)));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl DaemonInterface for RpcDaemon {
    async fn cmd(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let result = self.call_rpc(method, params).await;

        if let Err(Error::Network(message)) = &result {
            if self.is_online() {
                let _ = self.events.send(DaemonEvent::Error(message.clone()));
            }
        }

        result
    }
}
