//! Pool orchestration.
//!
//! A [`Pool`] owns the event loop that ties the node, the job manager and
//! the Stratum server together. It bootstraps once the node comes online,
//! starts the server and template polling, broadcasts new jobs, submits and
//! confirms found blocks, and reports every share outcome through
//! [`PoolEvent`](crate::events::PoolEvent).

mod bootstrap;
mod connection;
mod refresh;
mod submission;

pub use bootstrap::bootstrap;
pub use refresh::{on_block_notify, refresh_template};
pub use submission::{check_block_accepted, submit_block, Confirmation, SubmitOutcome};

use crate::config::PoolConfig;
use crate::daemon::{DaemonEvent, DaemonEventReceiver, DaemonInterface};
use crate::error::Result;
use crate::events::{category, PoolEventReceiver, PoolEventSender};
use crate::job_manager::{JobEvent, JobEventReceiver, JobManager};
use crate::reward::PublicKeyBuffer;
use crate::server::{
    AuthorizeFn, StratumEvent, StratumEventReceiver, StratumServer, StratumServerFactory, StratumServerOptions,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Chain facts learned during bootstrap; written once, read-only afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct ChainContext {
    pub public_key: PublicKeyBuffer,
    /// Whether the node supports `submitblock`
    pub has_submit_method: bool,
}

/// Collaborators shared by the pool's tasks
#[derive(Clone)]
pub struct PoolServices {
    pub pool_name: String,
    pub daemon: Arc<dyn DaemonInterface>,
    pub job_manager: Arc<dyn JobManager>,
    pub events: PoolEventSender,
}

/// Everything a pool needs from the outside
pub struct PoolComponents {
    pub daemon: Arc<dyn DaemonInterface>,
    pub daemon_events: DaemonEventReceiver,
    pub job_manager: Arc<dyn JobManager>,
    pub job_events: JobEventReceiver,
    pub stratum_factory: Arc<dyn StratumServerFactory>,
    pub authorize: AuthorizeFn,
}

#[derive(Debug)]
enum PoolCommand {
    BlockNotify(String),
    Shutdown,
}

/// Cloneable handle for controlling a running pool
#[derive(Debug, Clone)]
pub struct PoolHandle {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolHandle {
    /// Hint from a block-notify hook that the best block may have changed
    pub fn notify_possible_new_block(&self, block_hash: impl Into<String>) {
        let _ = self.commands.send(PoolCommand::BlockNotify(block_hash.into()));
    }

    /// Stop the pool loop, the Stratum server and polling
    pub fn shutdown(&self) {
        let _ = self.commands.send(PoolCommand::Shutdown);
    }
}

/// Mining pool orchestrator
pub struct Pool {
    config: Arc<PoolConfig>,
    services: PoolServices,
    stratum_factory: Arc<dyn StratumServerFactory>,
    authorize: AuthorizeFn,
    daemon_events: DaemonEventReceiver,
    job_events: JobEventReceiver,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
}

impl Pool {
    /// Create a pool, its control handle and its event stream
    pub fn new(config: PoolConfig, components: PoolComponents) -> (Self, PoolHandle, PoolEventReceiver) {
        let (events, events_rx) = PoolEventSender::channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let services = PoolServices {
            pool_name: config.name.clone(),
            daemon: components.daemon,
            job_manager: components.job_manager,
            events,
        };

        let pool = Self {
            config: Arc::new(config),
            services,
            stratum_factory: components.stratum_factory,
            authorize: components.authorize,
            daemon_events: components.daemon_events,
            job_events: components.job_events,
            commands: commands_rx,
        };

        (pool, PoolHandle { commands: commands_tx }, events_rx)
    }

    /// Run until shut down through a [`PoolHandle`]
    pub async fn run(self) {
        let Pool {
            config,
            services,
            stratum_factory,
            authorize,
            mut daemon_events,
            mut job_events,
            mut commands,
        } = self;

        let (bootstrap_tx, mut bootstrap_rx) = mpsc::unbounded_channel();
        let mut orchestrator = Orchestrator {
            config,
            services,
            stratum_factory,
            authorize,
            bootstrap_tx,
            bootstrap_started: false,
            context: None,
            stratum: None,
            polling: None,
        };
        let mut stratum_events: Option<StratumEventReceiver> = None;

        orchestrator.services.events.debug(category::SYSTEM, "Connecting to daemon");

        loop {
            tokio::select! {
                Some(event) = daemon_events.recv() => orchestrator.on_daemon_event(event),
                Some(result) = bootstrap_rx.recv() => {
                    if let Some(events) = orchestrator.on_bootstrapped(result).await {
                        stratum_events = Some(events);
                    }
                }
                Some(event) = job_events.recv() => orchestrator.on_job_event(event).await,
                event = next_stratum_event(&mut stratum_events) => match event {
                    Some(event) => orchestrator.on_stratum_event(event),
                    None => stratum_events = None,
                },
                Some(command) = commands.recv() => match command {
                    PoolCommand::BlockNotify(block_hash) => orchestrator.on_block_notify(block_hash),
                    PoolCommand::Shutdown => {
                        orchestrator.shutdown().await;
                        break;
                    }
                },
            }
        }
    }
}

async fn next_stratum_event(events: &mut Option<StratumEventReceiver>) -> Option<StratumEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// State owned by the pool loop
struct Orchestrator {
    config: Arc<PoolConfig>,
    services: PoolServices,
    stratum_factory: Arc<dyn StratumServerFactory>,
    authorize: AuthorizeFn,
    bootstrap_tx: mpsc::UnboundedSender<Result<ChainContext>>,
    bootstrap_started: bool,
    context: Option<Arc<ChainContext>>,
    stratum: Option<Arc<dyn StratumServer>>,
    polling: Option<JoinHandle<()>>,
}

impl Orchestrator {
    fn on_daemon_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::Online if !self.bootstrap_started => {
                self.bootstrap_started = true;
                let daemon = Arc::clone(&self.services.daemon);
                let config = Arc::clone(&self.config);
                let bootstrap_tx = self.bootstrap_tx.clone();
                tokio::spawn(async move {
                    let result = bootstrap(daemon.as_ref(), &config).await;
                    let _ = bootstrap_tx.send(result);
                });
            }
            DaemonEvent::Online => {}
            DaemonEvent::StartFailed => {
                self.services.events.error(category::SYSTEM, "Failed to start daemon");
            }
            DaemonEvent::Error(message) => {
                self.services.events.error(category::SYSTEM, message);
            }
        }
    }

    /// Start the server then polling; returns the server's event stream
    async fn on_bootstrapped(&mut self, result: Result<ChainContext>) -> Option<StratumEventReceiver> {
        let context = match result {
            Ok(context) => Arc::new(context),
            Err(e) => {
                self.services.events.error(category::SYSTEM, format!("Could not start pool: {}", e));
                return None;
            }
        };

        self.services.events.debug(category::SYSTEM, "Connected to daemon");

        let port = self.config.stratum_port;
        self.services.events.debug(category::SYSTEM, format!("Stratum server starting on port {}", port));

        let options = StratumServerOptions {
            port,
            authorize: Arc::clone(&self.authorize),
        };
        let (server, events) = match self.stratum_factory.start(options).await {
            Ok(started) => started,
            Err(e) => {
                self.services.events.error(
                    category::SYSTEM,
                    format!("Failed to start Stratum server on port {}: {}", port, e),
                );
                return None;
            }
        };
        self.stratum = Some(server);
        self.context = Some(Arc::clone(&context));

        self.polling = refresh::start_polling(
            self.services.clone(),
            context,
            self.config.block_refresh_interval,
        );

        Some(events)
    }

    async fn on_job_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::NewJob(params) => match &self.stratum {
                Some(server) => {
                    self.services.events.debug(category::SYSTEM, "Detected new block");
                    server.broadcast_mining_jobs(params).await;
                }
                None => {
                    self.services.events.warning(category::SYSTEM, "Stratum server still not started! cannot broadcast block!");
                }
            },
            JobEvent::Share { data, block_hex: None } => {
                submission::process_share(&self.services, self.context.as_deref(), data, None).await;
            }
            JobEvent::Share { data, block_hex: Some(block_hex) } => {
                info!("Block candidate {} found by {}", data.block_hash.as_deref().unwrap_or("?"), data.worker);
                let services = self.services.clone();
                let context = self.context.clone();
                tokio::spawn(async move {
                    submission::process_share(&services, context.as_deref(), data, Some(block_hex)).await;
                });
            }
        }
    }

    fn on_stratum_event(&mut self, event: StratumEvent) {
        match event {
            StratumEvent::Started => {
                self.services.events.debug(
                    category::SYSTEM,
                    format!("Stratum server started on port {}", self.config.stratum_port),
                );
                self.services.events.started();
            }
            StratumEvent::ClientConnected { client, events } => {
                tokio::spawn(connection::handle_client(
                    self.services.clone(),
                    client,
                    events,
                    self.config.difficulty,
                ));
            }
        }
    }

    fn on_block_notify(&mut self, block_hash: String) {
        let Some(context) = self.context.clone() else {
            self.services.events.warning(
                category::SYSTEM,
                format!("Ignoring block notify for {} before the pool has started", block_hash),
            );
            return;
        };

        let services = self.services.clone();
        tokio::spawn(async move {
            refresh::on_block_notify(&services, &context, &block_hash).await;
        });
    }

    async fn shutdown(&mut self) {
        if let Some(polling) = self.polling.take() {
            polling.abort();
        }
        if let Some(server) = self.stratum.take() {
            server.shutdown().await;
        }
        info!("Pool {} stopped", self.services.pool_name);
    }
}
