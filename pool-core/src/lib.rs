pub mod config;
pub mod error;
pub mod types;
pub mod events;
pub mod protocol;
pub mod reward;
pub mod daemon;
pub mod bitcoin_rpc;
pub mod block_template;
pub mod share_validator;
pub mod job_manager;
pub mod server;
pub mod pool;
pub mod metrics;
pub mod logging;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

#[cfg(test)]
mod pool_integration_tests;

pub use error::{Error, Result};
pub use config::PoolConfig;
pub use events::{LogLevel, PoolEvent, PoolEventReceiver};
pub use types::{JobParams, ShareData, ShareSubmission, StratumError};
pub use daemon::{DaemonEvent, DaemonInterface};
pub use bitcoin_rpc::RpcDaemon;
pub use job_manager::{JobManager, TemplateJobManager};
pub use server::{StratumServerFactory, TcpStratumServerFactory};
pub use pool::{ChainContext, Pool, PoolComponents, PoolHandle};
