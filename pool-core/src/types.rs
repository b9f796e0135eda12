use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a miner connection
pub type ClientId = Uuid;

/// Share submission assembled from a `mining.submit` plus connection state
#[derive(Debug, Clone, PartialEq)]
pub struct ShareSubmission {
    pub job_id: String,
    /// Difficulty assigned to the connection when the share was found
    pub difficulty: f64,
    pub extra_nonce1: String,
    pub extra_nonce2: String,
    pub ntime: String,
    pub nonce: String,
    /// Submitter IP address
    pub ip: String,
    pub worker: String,
}

/// Outcome of share validation, carried to the share event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareData {
    pub job_id: String,
    pub ip: String,
    pub worker: String,
    pub height: u64,
    /// Block reward in satoshis
    pub block_reward: u64,
    pub difficulty: f64,
    /// Difficulty actually achieved by the share, 0 when rejected before hashing
    pub share_diff: f64,
    /// Network difficulty of the job's template
    pub block_diff: f64,
    /// Candidate block hash, present when the share meets network difficulty
    pub block_hash: Option<String>,
    /// Rejection reason, `None` for a valid share
    pub error: Option<String>,
}

impl ShareData {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Positive share acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct ShareReceipt {
    pub share_diff: f64,
}

/// Reply to a submit: a receipt on success, a Stratum error otherwise
#[derive(Debug, Clone, PartialEq)]
pub struct ShareResponse {
    pub result: Option<ShareReceipt>,
    pub error: Option<StratumError>,
}

impl ShareResponse {
    pub fn accepted(share_diff: f64) -> Self {
        Self { result: Some(ShareReceipt { share_diff }), error: None }
    }

    pub fn rejected(error: StratumError) -> Self {
        Self { result: None, error: Some(error) }
    }
}

/// Stratum V1 error triple `[code, message, null]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

impl StratumError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(20, message)
    }

    pub fn job_not_found() -> Self {
        Self::new(21, "job not found")
    }

    pub fn duplicate_share() -> Self {
        Self::new(22, "duplicate share")
    }

    pub fn low_difficulty() -> Self {
        Self::new(23, "low difficulty share")
    }

    pub fn unauthorized() -> Self {
        Self::new(24, "unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(25, "not subscribed")
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!([self.code, self.message, null])
    }
}

impl std::fmt::Display for StratumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Parameters of a `mining.notify` broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub job_id: String,
    /// Previous block hash in Stratum word order
    pub prevhash: String,
    pub coinb1: String,
    pub coinb2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

impl JobParams {
    /// Positional params array of `mining.notify`
    pub fn to_notify_params(&self) -> Vec<Value> {
        vec![
            Value::String(self.job_id.clone()),
            Value::String(self.prevhash.clone()),
            Value::String(self.coinb1.clone()),
            Value::String(self.coinb2.clone()),
            Value::Array(self.merkle_branch.iter().cloned().map(Value::String).collect()),
            Value::String(self.version.clone()),
            Value::String(self.nbits.clone()),
            Value::String(self.ntime.clone()),
            Value::Bool(self.clean_jobs),
        ]
    }
}
