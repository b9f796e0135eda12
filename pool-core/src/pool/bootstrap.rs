use super::ChainContext;
use crate::config::PoolConfig;
use crate::daemon::DaemonInterface;
use crate::error::{Error, Result};
use crate::reward::{AddressInfo, PublicKeyBuffer};
use tracing::debug;

/// Validate the pool address and probe `submitblock` support, then derive the reward script
pub async fn bootstrap(daemon: &dyn DaemonInterface, config: &PoolConfig) -> Result<ChainContext> {
    let (address_info, has_submit_method) = tokio::try_join!(
        validate_pool_address(daemon, &config.address),
        probe_submit_method(daemon),
    )?;

    let public_key = PublicKeyBuffer::derive(config.reward, &config.address, &address_info)?;
    debug!("Reward script for {}: {}", config.address, hex::encode(public_key.as_bytes()));

    Ok(ChainContext {
        public_key,
        has_submit_method,
    })
}

async fn validate_pool_address(daemon: &dyn DaemonInterface, address: &str) -> Result<AddressInfo> {
    let info = daemon
        .validate_address(address)
        .await
        .map_err(|e| Error::Daemon(format!("validateaddress rpc error: {}", e)))?;
    if !info.isvalid {
        return Err(Error::Address(format!("address {} is not valid", address)));
    }
    Ok(info)
}

/// `submitblock` with no arguments: only "method not found" means unsupported
async fn probe_submit_method(daemon: &dyn DaemonInterface) -> Result<bool> {
    match daemon.cmd("submitblock", vec![]).await {
        Err(e) if e.is_method_not_found() => Ok(false),
        _ => Ok(true),
    }
}
