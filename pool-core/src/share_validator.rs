use crate::block_template::{le_bytes_to_f64, sha256d, MiningJob, DIFF1};
use crate::types::{ShareSubmission, StratumError};
use bitcoin::Target;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Seconds a share's ntime may run ahead of the pool clock
const MAX_NTIME_DRIFT: i64 = 7200;

/// Shares below this fraction of the assigned difficulty are rejected
const LOW_DIFFICULTY_TOLERANCE: f64 = 0.99;

/// A share that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedShare {
    pub share_diff: f64,
    /// Present when the share also meets the network target
    pub block: Option<BlockCandidate>,
}

/// Serialized block found by a share
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCandidate {
    pub hash: String,
    pub hex: String,
}

/// A rejected share and the difficulty it reached, 0 when never hashed
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRejection {
    pub error: StratumError,
    pub share_diff: f64,
}

/// Share validator with duplicate detection and proof-of-work checks
pub struct ShareValidator {
    extra_nonce2_size: usize,
    recent_submits: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl ShareValidator {
    /// Create a new share validator
    pub fn new(extra_nonce2_size: usize) -> Self {
        Self {
            extra_nonce2_size,
            recent_submits: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Forget all recorded submissions; called when the chain tip moves
    pub async fn clear(&self) {
        self.recent_submits.write().await.clear();
    }

    /// Validate a share submission against its job
    pub async fn validate(
        &self,
        job: &MiningJob,
        submission: &ShareSubmission,
    ) -> Result<ValidatedShare, ShareRejection> {
        let reject = |error: StratumError| ShareRejection { error, share_diff: 0.0 };

        if submission.extra_nonce2.len() != self.extra_nonce2_size * 2 {
            return Err(reject(StratumError::other("incorrect size of extranonce2")));
        }
        let extra_nonce1 = hex::decode(&submission.extra_nonce1)
            .map_err(|_| reject(StratumError::other("invalid extranonce1")))?;
        let extra_nonce2 = hex::decode(&submission.extra_nonce2)
            .map_err(|_| reject(StratumError::other("invalid extranonce2")))?;

        let ntime = parse_word(&submission.ntime)
            .ok_or_else(|| reject(StratumError::other("incorrect size of ntime")))?;
        let now = chrono::Utc::now().timestamp();
        if (ntime as i64) < job.template().curtime as i64 || ntime as i64 > now + MAX_NTIME_DRIFT {
            return Err(reject(StratumError::other("ntime out of range")));
        }

        let nonce = parse_word(&submission.nonce)
            .ok_or_else(|| reject(StratumError::other("incorrect size of nonce")))?;

        if !self.record_submit(job.job_id(), submission).await {
            return Err(reject(StratumError::duplicate_share()));
        }

        // Build block header for hashing
        let coinbase = job.serialize_coinbase(&extra_nonce1, &extra_nonce2);
        let merkle_root = job.merkle_root(sha256d(&coinbase));
        let header = job.serialize_header(&merkle_root, ntime, nonce);
        let hash = sha256d(&header);

        let share_diff = DIFF1 / le_bytes_to_f64(&hash).max(1.0);

        if Target::from_le_bytes(hash) <= job.target() {
            let block_hex = job.serialize_block(&header, &coinbase)
                .map_err(|e| ShareRejection { error: StratumError::other(e.to_string()), share_diff })?;
            let mut display = hash;
            display.reverse();

            return Ok(ValidatedShare {
                share_diff,
                block: Some(BlockCandidate {
                    hash: hex::encode(display),
                    hex: hex::encode(block_hex),
                }),
            });
        }

        if share_diff / submission.difficulty < LOW_DIFFICULTY_TOLERANCE {
            return Err(ShareRejection {
                error: StratumError::new(23, format!("low difficulty share of {}", share_diff)),
                share_diff,
            });
        }

        Ok(ValidatedShare { share_diff, block: None })
    }

    /// Record a submission, returning false if it was already seen
    async fn record_submit(&self, job_id: &str, submission: &ShareSubmission) -> bool {
        let key = format!(
            "{}{}{}{}",
            submission.extra_nonce1, submission.extra_nonce2, submission.ntime, submission.nonce
        ).to_lowercase();

        let mut recent = self.recent_submits.write().await;
        recent.entry(job_id.to_string()).or_default().insert(key)
    }
}

/// Parse an 8-hex-character big-endian word
fn parse_word(hex_str: &str) -> Option<u32> {
    if hex_str.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex_str, 16).ok()
}
