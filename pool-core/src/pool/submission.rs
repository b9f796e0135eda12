use super::{ChainContext, PoolServices};
use crate::daemon::DaemonInterface;
use crate::events::{category, PoolEventSender};
use crate::types::ShareData;
use serde_json::Value;

/// Result of handing a block to the node
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Submitted,
    /// The node answered with a rejection reason
    Rejected(String),
    /// The RPC itself failed
    Failed(String),
}

/// Result of looking the submitted block up again
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    Accepted,
    /// The node returned a different block, or none
    Mismatch { reported_hash: Option<String> },
    LookupFailed(String),
}

impl Confirmation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Confirmation::Accepted)
    }
}

/// Submit a block with `submitblock`, or `getblocktemplate` in submit mode when unsupported
pub async fn submit_block(
    daemon: &dyn DaemonInterface,
    events: &PoolEventSender,
    has_submit_method: bool,
    block_hex: &str,
) -> SubmitOutcome {
    let (method, result) = if has_submit_method {
        ("submitblock", daemon.submit_block(block_hex).await)
    } else {
        ("getblocktemplate", daemon.submit_block_via_template(block_hex).await)
    };

    match result {
        Ok(Value::Null) => {
            events.debug(category::SUBMITBLOCK, format!("Submitted Block using {} successfully to daemon", method));
            SubmitOutcome::Submitted
        }
        Ok(Value::String(reason)) => {
            events.error(category::SUBMITBLOCK, format!("Daemon rejected a supposedly valid block: {}", reason));
            SubmitOutcome::Rejected(reason)
        }
        Ok(other) => {
            events.debug(category::SUBMITBLOCK, format!("Submitted Block using {}, daemon answered {}", method, other));
            SubmitOutcome::Submitted
        }
        Err(e) => {
            events.error(category::SUBMITBLOCK, format!("rpc error when submitting block with {}: {}", method, e));
            SubmitOutcome::Failed(e.to_string())
        }
    }
}

/// Accepted only when `getblock` returns the block under exactly the submitted hash
pub async fn check_block_accepted(daemon: &dyn DaemonInterface, block_hash: &str) -> Confirmation {
    match daemon.get_block(block_hash).await {
        Ok(block) => match block.get("hash").and_then(Value::as_str) {
            Some(hash) if hash == block_hash => Confirmation::Accepted,
            reported => Confirmation::Mismatch { reported_hash: reported.map(str::to_string) },
        },
        Err(e) => Confirmation::LookupFailed(e.to_string()),
    }
}

/// Emit the final outcome of a share; block candidates are submitted and confirmed first
pub async fn process_share(
    services: &PoolServices,
    context: Option<&ChainContext>,
    data: ShareData,
    block_hex: Option<String>,
) {
    let valid_share = data.is_valid();

    let Some(block_hex) = block_hex else {
        services.events.share(valid_share, false, data);
        return;
    };

    let has_submit_method = context.map(|c| c.has_submit_method).unwrap_or(false);
    let outcome = submit_block(services.daemon.as_ref(), &services.events, has_submit_method, &block_hex).await;

    let Some(block_hash) = data.block_hash.clone() else {
        services.events.error(
            category::CHECKBLOCK,
            format!("Block candidate from {} has no block hash to confirm ({:?})", data.worker, outcome),
        );
        services.events.share(valid_share, false, data);
        return;
    };
    let confirmation = check_block_accepted(services.daemon.as_ref(), &block_hash).await;

    match &confirmation {
        Confirmation::Accepted => {
            services.events.debug(category::CHECKBLOCK, format!("Block {} accepted by daemon", block_hash));
        }
        Confirmation::Mismatch { reported_hash } => {
            services.events.warning(
                category::CHECKBLOCK,
                format!("Block {} not accepted, daemon reports {:?} ({:?})", block_hash, reported_hash, outcome),
            );
        }
        Confirmation::LookupFailed(e) => {
            services.events.warning(
                category::CHECKBLOCK,
                format!("Block {} not accepted, lookup failed: {} ({:?})", block_hash, e, outcome),
            );
        }
    }

    services.events.share(valid_share, confirmation.is_accepted(), data);
}
