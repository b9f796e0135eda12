// TCP server implementation for Stratum V1 miners
use crate::{
    error::{Error, Result},
    protocol::StratumMessage,
    types::{ClientId, JobParams, StratumError},
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{mpsc, watch, RwLock},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bytes buffered without a newline before a connection is dropped
const MAX_LINE_BUFFER: usize = 10 * 1024;

/// Split the next complete line off the buffer, decoded once it is whole
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let newline_pos = buffer.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

/// Decides whether a worker may submit shares: (ip, worker, password)
pub type AuthorizeFn = Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;

/// Options handed to a server factory
#[derive(Clone)]
pub struct StratumServerOptions {
    pub port: u16,
    pub authorize: AuthorizeFn,
}

/// Server-level signals
pub enum StratumEvent {
    /// The server is bound and accepting miners
    Started,
    /// A miner connected; its events arrive on `events`
    ClientConnected {
        client: Arc<dyn StratumClient>,
        events: ClientEventReceiver,
    },
}

/// Replies to `mining.subscribe` with (extranonce1, extranonce2 size)
pub type SubscriptionResponder = Box<dyn FnOnce(String, usize) + Send>;

/// Replies to `mining.submit` with (error, accepted)
pub type SubmitResponder = Box<dyn FnOnce(Option<StratumError>, bool) + Send>;

/// Fields of a `mining.submit` request
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extra_nonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// Per-connection signals
pub enum ClientEvent {
    Subscription { respond: SubscriptionResponder },
    Submit { params: SubmitParams, respond: SubmitResponder },
    MalformedMessage(String),
    SocketError(String),
    SocketDisconnect,
    UnknownStratumMethod(String),
}

impl std::fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::Subscription { .. } => write!(f, "Subscription"),
            ClientEvent::Submit { params, .. } => write!(f, "Submit({:?})", params),
            ClientEvent::MalformedMessage(msg) => write!(f, "MalformedMessage({})", msg),
            ClientEvent::SocketError(msg) => write!(f, "SocketError({})", msg),
            ClientEvent::SocketDisconnect => write!(f, "SocketDisconnect"),
            ClientEvent::UnknownStratumMethod(method) => write!(f, "UnknownStratumMethod({})", method),
        }
    }
}

pub type StratumEventSender = mpsc::UnboundedSender<StratumEvent>;
pub type StratumEventReceiver = mpsc::UnboundedReceiver<StratumEvent>;
pub type ClientEventSender = mpsc::UnboundedSender<ClientEvent>;
pub type ClientEventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Creates a running Stratum server
#[async_trait]
pub trait StratumServerFactory: Send + Sync {
    async fn start(&self, options: StratumServerOptions) -> Result<(Arc<dyn StratumServer>, StratumEventReceiver)>;
}

/// Running Stratum server
#[async_trait]
pub trait StratumServer: Send + Sync {
    /// Send a job to every subscribed miner
    async fn broadcast_mining_jobs(&self, params: JobParams);

    async fn client_count(&self) -> usize;

    async fn shutdown(&self);
}

/// One connected miner
pub trait StratumClient: Send + Sync {
    fn id(&self) -> ClientId;

    fn remote_address(&self) -> String;

    /// Worker name from `mining.authorize`, if any
    fn worker_name(&self) -> Option<String>;

    fn difficulty(&self) -> f64;

    fn extra_nonce1(&self) -> Option<String>;

    /// Push a difficulty unless it is already the client's; returns true if sent
    fn send_difficulty_if_new(&self, difficulty: f64) -> bool;

    fn send_mining_job(&self, params: JobParams);
}

#[derive(Debug, Default)]
struct ClientState {
    extra_nonce1: Option<String>,
    authorized: bool,
    worker_name: Option<String>,
    difficulty: f64,
}

/// Miner connected over TCP
pub struct TcpStratumClient {
    id: ClientId,
    remote_address: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    state: Mutex<ClientState>,
}

impl TcpStratumClient {
    fn new(id: ClientId, remote_address: SocketAddr, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            remote_address,
            outbound,
            state: Mutex::new(ClientState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: &StratumMessage) {
        match message.to_json() {
            Ok(line) => {
                if self.outbound.send(line).is_err() {
                    debug!("Dropping message for closed connection {}", self.id);
                }
            }
            Err(e) => error!("Failed to encode message for {}: {}", self.id, e),
        }
    }

    fn worker_label(&self) -> String {
        self.state()
            .worker_name
            .clone()
            .unwrap_or_else(|| format!("(unauthorized {})", self.remote_address.ip()))
    }
}

impl StratumClient for TcpStratumClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn remote_address(&self) -> String {
        self.remote_address.ip().to_string()
    }

    fn worker_name(&self) -> Option<String> {
        self.state().worker_name.clone()
    }

    fn difficulty(&self) -> f64 {
        self.state().difficulty
    }

    fn extra_nonce1(&self) -> Option<String> {
        self.state().extra_nonce1.clone()
    }

    fn send_difficulty_if_new(&self, difficulty: f64) -> bool {
        {
            let mut state = self.state();
            if state.difficulty == difficulty {
                return false;
            }
            state.difficulty = difficulty;
        }
        self.send(&StratumMessage::set_difficulty(difficulty));
        true
    }

    fn send_mining_job(&self, params: JobParams) {
        if self.state().extra_nonce1.is_none() {
            return;
        }
        self.send(&StratumMessage::notify(&params));
    }
}

/// Connection handler for individual miner connections
struct ConnectionHandler {
    client: Arc<TcpStratumClient>,
    events: ClientEventSender,
    authorize: AuthorizeFn,
}

impl ConnectionHandler {
    /// Handle the connection lifecycle
    async fn handle(
        self,
        stream: TcpStream,
        outbound_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let client_id = self.client.id;
        let (mut reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(Self::write_loop(writer, outbound_rx));

        let mut buffer = vec![0u8; 4096];
        let mut message_buffer: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                result = reader.read(&mut buffer) => {
                    match result {
                        Ok(0) => {
                            debug!("Connection closed by peer: {}", client_id);
                            break;
                        }
                        Ok(n) => {
                            message_buffer.extend_from_slice(&buffer[..n]);

                            if message_buffer.len() > MAX_LINE_BUFFER && !message_buffer.contains(&b'\n') {
                                let _ = self.events.send(ClientEvent::MalformedMessage("socket flooded".to_string()));
                                break;
                            }

                            if !self.drain_lines(&mut message_buffer) {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = self.events.send(ClientEvent::SocketError(e.to_string()));
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Shutting down connection: {}", client_id);
                    break;
                }
            }
        }

        writer_task.abort();
        let _ = self.events.send(ClientEvent::SocketDisconnect);
    }

    /// Process complete newline-delimited messages; false closes the connection
    fn drain_lines(&self, message_buffer: &mut Vec<u8>) -> bool {
        while let Some(line) = take_line(message_buffer) {
            if line.is_empty() {
                continue;
            }

            match StratumMessage::from_line(&line) {
                Ok(message) => self.process_message(message),
                Err(_) => {
                    let _ = self.events.send(ClientEvent::MalformedMessage(line));
                    return false;
                }
            }
        }
        true
    }

    /// Process a single request from the miner
    fn process_message(&self, message: StratumMessage) {
        let method = message.method.clone().unwrap_or_default();
        let id = message.id.clone();

        match method.as_str() {
            "mining.subscribe" => {
                let client = Arc::clone(&self.client);
                let respond: SubscriptionResponder = Box::new(move |extra_nonce1, extra_nonce2_size| {
                    client.state().extra_nonce1 = Some(extra_nonce1.clone());
                    let subscription_id = client.id.simple().to_string();
                    let result = json!([
                        [["mining.set_difficulty", subscription_id], ["mining.notify", subscription_id]],
                        extra_nonce1,
                        extra_nonce2_size
                    ]);
                    client.send(&StratumMessage::response(id, result, None));
                });
                let _ = self.events.send(ClientEvent::Subscription { respond });
            }
            "mining.authorize" => {
                let worker = message.param_str(0).unwrap_or_default().to_string();
                let password = message.param_str(1).unwrap_or_default().to_string();
                let authorized = (self.authorize)(&self.client.remote_address(), &worker, &password);
                {
                    let mut state = self.client.state();
                    state.authorized = authorized;
                    state.worker_name = Some(worker);
                }
                self.client.send(&StratumMessage::response(id, Value::Bool(authorized), None));
            }
            "mining.submit" => {
                let (authorized, subscribed) = {
                    let state = self.client.state();
                    (state.authorized, state.extra_nonce1.is_some())
                };

                if !authorized {
                    let error = StratumError::unauthorized();
                    self.client.send(&StratumMessage::response(id, Value::Null, Some(&error)));
                    return;
                }
                if !subscribed {
                    let error = StratumError::not_subscribed();
                    self.client.send(&StratumMessage::response(id, Value::Null, Some(&error)));
                    return;
                }

                let params = SubmitParams {
                    worker: message.param_str(0).unwrap_or_default().to_string(),
                    job_id: message.param_str(1).unwrap_or_default().to_string(),
                    extra_nonce2: message.param_str(2).unwrap_or_default().to_lowercase(),
                    ntime: message.param_str(3).unwrap_or_default().to_lowercase(),
                    nonce: message.param_str(4).unwrap_or_default().to_lowercase(),
                };

                let client = Arc::clone(&self.client);
                let respond: SubmitResponder = Box::new(move |error, accepted| {
                    let result = if accepted { Value::Bool(true) } else { Value::Null };
                    client.send(&StratumMessage::response(id, result, error.as_ref()));
                });
                let _ = self.events.send(ClientEvent::Submit { params, respond });
            }
            "mining.extranonce.subscribe" => {
                self.client.send(&StratumMessage::response(id, Value::Bool(false), None));
            }
            _ => {
                let _ = self.events.send(ClientEvent::UnknownStratumMethod(method));
            }
        }
    }

    /// Write queued lines to the socket
    async fn write_loop(mut writer: OwnedWriteHalf, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = Self::send_line(&mut writer, &line).await {
                debug!("Stopping writer: {}", e);
                break;
            }
        }
    }

    async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
        let line_with_newline = format!("{}\n", line);
        writer.write_all(line_with_newline.as_bytes()).await
            .map_err(|e| Error::Network(format!("Failed to send line: {}", e)))?;
        writer.flush().await
            .map_err(|e| Error::Network(format!("Failed to flush line: {}", e)))?;
        Ok(())
    }
}

/// TCP server for Stratum V1 miners
pub struct TcpStratumServer {
    local_addr: SocketAddr,
    clients: Arc<RwLock<HashMap<ClientId, Arc<TcpStratumClient>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TcpStratumServer {
    /// Bind and start accepting miners
    pub async fn bind(
        bind_address: SocketAddr,
        authorize: AuthorizeFn,
    ) -> Result<(Arc<Self>, StratumEventReceiver)> {
        let listener = TcpListener::bind(bind_address).await
            .map_err(|e| Error::Network(format!("Failed to bind to {}: {}", bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        info!("Stratum server listening on {}", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = Arc::new(Self {
            local_addr,
            clients: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
        });

        let _ = events_tx.send(StratumEvent::Started);
        tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&server.clients),
            events_tx,
            authorize,
            shutdown_rx,
        ));

        Ok((server, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(
        listener: TcpListener,
        clients: Arc<RwLock<HashMap<ClientId, Arc<TcpStratumClient>>>>,
        events_tx: StratumEventSender,
        authorize: AuthorizeFn,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let client_id = Uuid::new_v4();
                            debug!("Accepted connection from {}: {}", peer_addr, client_id);

                            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                            let (client_events_tx, client_events_rx) = mpsc::unbounded_channel();
                            let client = Arc::new(TcpStratumClient::new(client_id, peer_addr, outbound_tx));

                            clients.write().await.insert(client_id, Arc::clone(&client));

                            let connected = StratumEvent::ClientConnected {
                                client: Arc::clone(&client) as Arc<dyn StratumClient>,
                                events: client_events_rx,
                            };
                            if events_tx.send(connected).is_err() {
                                warn!("No listener for Stratum events, dropping {}", peer_addr);
                                clients.write().await.remove(&client_id);
                                continue;
                            }

                            let handler = ConnectionHandler {
                                client,
                                events: client_events_tx,
                                authorize: Arc::clone(&authorize),
                            };
                            let clients = Arc::clone(&clients);
                            let shutdown_rx = shutdown_rx.clone();
                            tokio::spawn(async move {
                                handler.handle(stream, outbound_rx, shutdown_rx).await;
                                clients.write().await.remove(&client_id);
                                debug!("Connection {} cleaned up", client_id);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutting down Stratum server");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StratumServer for TcpStratumServer {
    async fn broadcast_mining_jobs(&self, params: JobParams) {
        let clients = self.clients.read().await;
        debug!("Broadcasting job {} to {} clients", params.job_id, clients.len());
        for client in clients.values() {
            client.send_mining_job(params.clone());
        }
    }

    async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Factory binding TCP servers on a fixed interface
pub struct TcpStratumServerFactory {
    bind_host: IpAddr,
}

impl TcpStratumServerFactory {
    pub fn new(bind_host: IpAddr) -> Self {
        Self { bind_host }
    }
}

#[async_trait]
impl StratumServerFactory for TcpStratumServerFactory {
    async fn start(&self, options: StratumServerOptions) -> Result<(Arc<dyn StratumServer>, StratumEventReceiver)> {
        let (server, events) = TcpStratumServer::bind(
            SocketAddr::new(self.bind_host, options.port),
            options.authorize,
        ).await?;
        Ok((server as Arc<dyn StratumServer>, events))
    }
}

/// Label used in log lines for a client
pub(crate) fn client_label(client: &dyn StratumClient) -> String {
    client
        .worker_name()
        .unwrap_or_else(|| format!("(unauthorized {})", client.remote_address()))
}
