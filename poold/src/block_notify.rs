//! Block notify listener.
//!
//! The node's `-blocknotify` hook connects and writes one block hash per
//! line; each hash is forwarded to the pool as a possible new block.

use pool_core::PoolHandle;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub async fn bind(bind_address: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(bind_address).await?;
    info!("Block notify listener on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept notify connections for the life of the process
pub async fn serve(listener: TcpListener, handle: PoolHandle) {
    accept_loop(|| listener.accept(), handle).await
}

async fn accept_loop<F, Fut>(mut accept: F, handle: PoolHandle)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, addr)) => {
                debug!("Block notify connection from {}", addr);
                tokio::spawn(read_hashes(stream, handle.clone()));
            }
            Err(e) => {
                error!("Failed to accept block notify connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn read_hashes(stream: TcpStream, handle: PoolHandle) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let block_hash = line.trim();
                if is_block_hash(block_hash) {
                    handle.notify_possible_new_block(block_hash.to_lowercase());
                } else if !block_hash.is_empty() {
                    warn!("Ignoring malformed block notify line: {}", block_hash);
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("Block notify read error: {}", e);
                return;
            }
        }
    }
}

fn is_block_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
