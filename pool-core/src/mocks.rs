//! In-memory collaborators for exercising the pool without a node or sockets.

use crate::block_template::BlockTemplate;
use crate::daemon::DaemonInterface;
use crate::error::{Error, Result, RPC_METHOD_NOT_FOUND};
use crate::job_manager::{CurrentJob, JobEvent, JobEventReceiver, JobEventSender, JobManager};
use crate::reward::PublicKeyBuffer;
use crate::server::{
    ClientEvent, ClientEventSender, StratumClient, StratumEvent, StratumEventSender, StratumServer,
    StratumServerFactory, StratumServerOptions, StratumEventReceiver, SubmitResponder, SubscriptionResponder,
};
use crate::types::{ClientId, JobParams, ShareResponse, ShareSubmission, StratumError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Job parameters with recognisable placeholder values
pub fn create_test_job_params(job_id: &str) -> JobParams {
    JobParams {
        job_id: job_id.to_string(),
        prevhash: "00".repeat(32),
        coinb1: "01000000".to_string(),
        coinb2: "ffffffff".to_string(),
        merkle_branch: vec![],
        version: "20000000".to_string(),
        nbits: "1d00ffff".to_string(),
        ntime: "65a1b2c3".to_string(),
        clean_jobs: true,
    }
}

/// Minimal template on top of `previous_block_hash`
pub fn create_test_template(previous_block_hash: &str, height: u64) -> BlockTemplate {
    BlockTemplate {
        version: 0x20000000,
        previousblockhash: previous_block_hash.to_string(),
        transactions: vec![],
        coinbaseaux: HashMap::new(),
        coinbasevalue: 312_500_000,
        target: None,
        mintime: 0,
        curtime: chrono::Utc::now().timestamp() as u32 - 60,
        bits: "1d00ffff".to_string(),
        height,
        default_witness_commitment: None,
    }
}

#[derive(Debug, Clone)]
enum CannedResponse {
    Result(Value),
    Rpc { code: i64, message: String },
    Transport(String),
}

/// Daemon answering from canned per-method responses
#[derive(Debug, Default)]
pub struct MockDaemon {
    responses: Mutex<HashMap<String, CannedResponse>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MockDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every later call to `method` with `response`; unset methods are "Method not found"
    pub fn respond(&self, method: &str, response: Result<Value>) {
        let canned = match response {
            Ok(value) => CannedResponse::Result(value),
            Err(Error::Rpc { code, message }) => CannedResponse::Rpc { code, message },
            Err(Error::Network(message)) => CannedResponse::Transport(message),
            Err(other) => CannedResponse::Transport(other.to_string()),
        };
        lock(&self.responses).insert(method.to_string(), canned);
    }

    /// Calls in the order they were made
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        lock(&self.calls).clone()
    }

    pub fn methods(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|(method, _)| method.clone()).collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        lock(&self.calls).iter().filter(|(m, _)| m == method).count()
    }
}

#[async_trait]
impl DaemonInterface for MockDaemon {
    async fn cmd(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        lock(&self.calls).push((method.to_string(), params));

        match lock(&self.responses).get(method).cloned() {
            Some(CannedResponse::Result(value)) => Ok(value),
            Some(CannedResponse::Rpc { code, message }) => Err(Error::Rpc { code, message }),
            Some(CannedResponse::Transport(message)) => Err(Error::Network(message)),
            None => Err(Error::Rpc {
                code: RPC_METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
            }),
        }
    }
}

/// Job manager recording what the pool hands it
pub struct MockJobManager {
    events: JobEventSender,
    current_job: Mutex<Option<CurrentJob>>,
    share_response: Mutex<ShareResponse>,
    templates: Mutex<Vec<BlockTemplate>>,
    shares: Mutex<Vec<ShareSubmission>>,
    extra_nonce_counter: Mutex<u32>,
}

impl MockJobManager {
    pub fn new() -> (Arc<Self>, JobEventReceiver) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            events,
            current_job: Mutex::new(None),
            share_response: Mutex::new(ShareResponse::accepted(1.0)),
            templates: Mutex::new(Vec::new()),
            shares: Mutex::new(Vec::new()),
            extra_nonce_counter: Mutex::new(0x0800_0000),
        };
        (Arc::new(manager), events_rx)
    }

    /// Raise a job event as if validation or a template produced it
    pub fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_current_job(&self, job: Option<CurrentJob>) {
        *lock(&self.current_job) = job;
    }

    pub fn set_share_response(&self, response: ShareResponse) {
        *lock(&self.share_response) = response;
    }

    pub fn templates_processed(&self) -> usize {
        lock(&self.templates).len()
    }

    pub fn shares(&self) -> Vec<ShareSubmission> {
        lock(&self.shares).clone()
    }
}

#[async_trait]
impl JobManager for MockJobManager {
    async fn process_template(&self, template: BlockTemplate, _public_key: &PublicKeyBuffer) -> Result<bool> {
        lock(&self.templates).push(template);
        Ok(false)
    }

    async fn process_share(&self, submission: ShareSubmission) -> ShareResponse {
        lock(&self.shares).push(submission);
        lock(&self.share_response).clone()
    }

    fn next_extra_nonce1(&self) -> String {
        let mut counter = lock(&self.extra_nonce_counter);
        *counter += 1;
        format!("{:08x}", *counter)
    }

    fn extra_nonce2_size(&self) -> usize {
        4
    }

    async fn current_job(&self) -> Option<CurrentJob> {
        lock(&self.current_job).clone()
    }
}

/// Server recording broadcasts
pub struct MockStratumServer {
    broadcasts: Arc<Mutex<Vec<JobParams>>>,
    shut_down: Mutex<bool>,
}

#[async_trait]
impl StratumServer for MockStratumServer {
    async fn broadcast_mining_jobs(&self, params: JobParams) {
        lock(&self.broadcasts).push(params);
    }

    async fn client_count(&self) -> usize {
        0
    }

    async fn shutdown(&self) {
        *lock(&self.shut_down) = true;
    }
}

/// Factory whose servers are driven by the test
#[derive(Default)]
pub struct MockStratumFactory {
    fail_start: Mutex<bool>,
    started_ports: Mutex<Vec<u16>>,
    events: Mutex<Option<StratumEventSender>>,
    broadcasts: Arc<Mutex<Vec<JobParams>>>,
    server: Mutex<Option<Arc<MockStratumServer>>>,
}

impl MockStratumFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_start(&self, fail: bool) {
        *lock(&self.fail_start) = fail;
    }

    /// Ports of every server started so far
    pub fn started_ports(&self) -> Vec<u16> {
        lock(&self.started_ports).clone()
    }

    pub fn broadcasts(&self) -> Vec<JobParams> {
        lock(&self.broadcasts).clone()
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.server)
            .as_ref()
            .map(|server| *lock(&server.shut_down))
            .unwrap_or(false)
    }

    /// Connect a client to the running server; returns the sender for its events
    pub fn connect(&self, client: Arc<MockStratumClient>) -> Option<ClientEventSender> {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let events = lock(&self.events).clone()?;
        events
            .send(StratumEvent::ClientConnected {
                client: client as Arc<dyn StratumClient>,
                events: client_rx,
            })
            .ok()?;
        Some(client_tx)
    }
}

#[async_trait]
impl StratumServerFactory for MockStratumFactory {
    async fn start(&self, options: StratumServerOptions) -> Result<(Arc<dyn StratumServer>, StratumEventReceiver)> {
        if *lock(&self.fail_start) {
            return Err(Error::Network(format!("Failed to bind to port {}", options.port)));
        }

        lock(&self.started_ports).push(options.port);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(StratumEvent::Started);
        *lock(&self.events) = Some(events_tx);

        let server = Arc::new(MockStratumServer {
            broadcasts: Arc::clone(&self.broadcasts),
            shut_down: Mutex::new(false),
        });
        *lock(&self.server) = Some(Arc::clone(&server));

        Ok((server as Arc<dyn StratumServer>, events_rx))
    }
}

/// Everything the pool sent to a client, in order
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SubscribeReply { extra_nonce1: String, extra_nonce2_size: usize },
    SubmitReply { error: Option<StratumError>, accepted: bool },
    Difficulty(f64),
    Job(JobParams),
}

/// Client recording every reply and push
pub struct MockStratumClient {
    id: ClientId,
    remote_address: String,
    worker_name: Mutex<Option<String>>,
    difficulty: Mutex<f64>,
    extra_nonce1: Mutex<Option<String>>,
    messages: Mutex<Vec<ClientMessage>>,
}

impl MockStratumClient {
    pub fn new(remote_address: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            remote_address: remote_address.to_string(),
            worker_name: Mutex::new(None),
            difficulty: Mutex::new(0.0),
            extra_nonce1: Mutex::new(None),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn set_worker_name(&self, worker: &str) {
        *lock(&self.worker_name) = Some(worker.to_string());
    }

    pub fn messages(&self) -> Vec<ClientMessage> {
        lock(&self.messages).clone()
    }

    /// Subscription event whose reply is recorded on this client
    pub fn subscription(self: &Arc<Self>) -> ClientEvent {
        let client = Arc::clone(self);
        let respond: SubscriptionResponder = Box::new(move |extra_nonce1, extra_nonce2_size| {
            *lock(&client.extra_nonce1) = Some(extra_nonce1.clone());
            lock(&client.messages).push(ClientMessage::SubscribeReply { extra_nonce1, extra_nonce2_size });
        });
        ClientEvent::Subscription { respond }
    }

    /// Submit event whose reply is recorded on this client
    pub fn submit(self: &Arc<Self>, params: crate::server::SubmitParams) -> ClientEvent {
        let client = Arc::clone(self);
        let respond: SubmitResponder = Box::new(move |error, accepted| {
            lock(&client.messages).push(ClientMessage::SubmitReply { error, accepted });
        });
        ClientEvent::Submit { params, respond }
    }
}

impl StratumClient for MockStratumClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn worker_name(&self) -> Option<String> {
        lock(&self.worker_name).clone()
    }

    fn difficulty(&self) -> f64 {
        *lock(&self.difficulty)
    }

    fn extra_nonce1(&self) -> Option<String> {
        lock(&self.extra_nonce1).clone()
    }

    fn send_difficulty_if_new(&self, difficulty: f64) -> bool {
        {
            let mut current = lock(&self.difficulty);
            if *current == difficulty {
                return false;
            }
            *current = difficulty;
        }
        lock(&self.messages).push(ClientMessage::Difficulty(difficulty));
        true
    }

    fn send_mining_job(&self, params: JobParams) {
        lock(&self.messages).push(ClientMessage::Job(params));
    }
}
