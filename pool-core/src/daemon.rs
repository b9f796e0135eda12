use crate::{Result, Error};
use crate::block_template::BlockTemplate;
use crate::reward::AddressInfo;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Capabilities advertised with every `getblocktemplate` request
pub const TEMPLATE_CAPABILITIES: [&str; 3] = ["coinbasetxn", "workid", "coinbase/append"];

/// Lifecycle signals raised by a daemon connection
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    /// The node answered and is ready for commands
    Online,
    /// The node never came up; terminal
    StartFailed,
    /// Non-terminal failure after the node came online
    Error(String),
}

pub type DaemonEventSender = mpsc::UnboundedSender<DaemonEvent>;
pub type DaemonEventReceiver = mpsc::UnboundedReceiver<DaemonEvent>;

/// Command interface to the blockchain node
#[async_trait]
pub trait DaemonInterface: Send + Sync {
    /// Execute a single RPC command
    async fn cmd(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    /// Validate an address with `validateaddress`
    async fn validate_address(&self, address: &str) -> Result<AddressInfo> {
        let result = self.cmd("validateaddress", vec![json!(address)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Submit a block with `submitblock`
    async fn submit_block(&self, block_hex: &str) -> Result<Value> {
        self.cmd("submitblock", vec![json!(block_hex)]).await
    }

    /// Submit a block through `getblocktemplate` in submit mode
    async fn submit_block_via_template(&self, block_hex: &str) -> Result<Value> {
        self.cmd("getblocktemplate", vec![json!({"mode": "submit", "data": block_hex})]).await
    }

    /// Fetch a block template with the pool's capability list
    async fn get_block_template(&self) -> Result<BlockTemplate> {
        let result = self
            .cmd("getblocktemplate", vec![json!({"capabilities": TEMPLATE_CAPABILITIES})])
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Template(format!("Malformed block template: {}", e)))
    }

    /// Look a block up by hash with `getblock`
    async fn get_block(&self, hash: &str) -> Result<Value> {
        self.cmd("getblock", vec![json!(hash)]).await
    }
}
