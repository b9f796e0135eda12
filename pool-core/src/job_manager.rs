use crate::Result;
use crate::block_template::{BlockTemplate, MiningJob};
use crate::config::JobConfig;
use crate::reward::PublicKeyBuffer;
use crate::share_validator::{ShareRejection, ShareValidator, ValidatedShare};
use crate::types::{JobParams, ShareData, ShareResponse, ShareSubmission, StratumError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Size in bytes of the extranonce1 handed to each miner
pub const EXTRA_NONCE1_SIZE: usize = 4;

/// Signals raised by a job manager
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A template on a new chain tip produced a job to broadcast
    NewJob(JobParams),
    /// A share was validated; `block_hex` is set when it solves a block
    Share {
        data: ShareData,
        block_hex: Option<String>,
    },
}

pub type JobEventSender = mpsc::UnboundedSender<JobEvent>;
pub type JobEventReceiver = mpsc::UnboundedReceiver<JobEvent>;

/// Read-only view of the job miners are currently working on
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentJob {
    params: JobParams,
    previous_block_hash: String,
}

impl CurrentJob {
    pub fn new(params: JobParams, previous_block_hash: impl Into<String>) -> Self {
        Self { params, previous_block_hash: previous_block_hash.into() }
    }

    pub fn job_params(&self) -> JobParams {
        self.params.clone()
    }

    pub fn previous_block_hash(&self) -> &str {
        &self.previous_block_hash
    }
}

/// Converts templates into jobs and validates shares against them
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Process a fetched template; returns true if it produced a new job
    async fn process_template(&self, template: BlockTemplate, public_key: &PublicKeyBuffer) -> Result<bool>;

    /// Validate a share and report the outcome through `JobEvent::Share`
    async fn process_share(&self, submission: ShareSubmission) -> ShareResponse;

    /// Allocate a fresh extranonce1 for a subscribing miner
    fn next_extra_nonce1(&self) -> String;

    fn extra_nonce2_size(&self) -> usize;

    async fn current_job(&self) -> Option<CurrentJob>;
}

/// Allocates unique extranonce1 values
#[derive(Debug)]
pub struct ExtraNonceCounter {
    counter: AtomicU32,
}

impl ExtraNonceCounter {
    /// Create a new counter seeded from an instance id; random when `None`
    pub fn new(instance_id: Option<u32>) -> Self {
        let instance = instance_id.unwrap_or_else(rand::random::<u32>);
        Self {
            counter: AtomicU32::new(instance.wrapping_shl(27)),
        }
    }

    pub fn next(&self) -> String {
        let value = self.counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        format!("{:08x}", value)
    }
}

/// Job manager driven by `getblocktemplate` results
pub struct TemplateJobManager {
    config: JobConfig,
    extra_nonce_counter: ExtraNonceCounter,
    job_counter: AtomicU64,
    current_job: RwLock<Option<Arc<MiningJob>>>,
    valid_jobs: RwLock<HashMap<String, Arc<MiningJob>>>,
    validator: ShareValidator,
    events: JobEventSender,
}

impl TemplateJobManager {
    /// Create a new job manager and the receiver for its events
    pub fn new(config: JobConfig) -> (Self, JobEventReceiver) {
        let (events, events_rx) = mpsc::unbounded_channel();

        let manager = Self {
            extra_nonce_counter: ExtraNonceCounter::new(config.extra_nonce1_instance),
            job_counter: AtomicU64::new(0),
            current_job: RwLock::new(None),
            valid_jobs: RwLock::new(HashMap::new()),
            validator: ShareValidator::new(config.extra_nonce2_size),
            events,
            config,
        };

        (manager, events_rx)
    }

    fn next_job_id(&self) -> String {
        let id = self.job_counter.fetch_add(1, Ordering::SeqCst) % 0xffff + 1;
        format!("{:x}", id)
    }

    fn emit_share(&self, data: ShareData, block_hex: Option<String>) {
        let _ = self.events.send(JobEvent::Share { data, block_hex });
    }

    fn share_data(&self, job: Option<&MiningJob>, submission: &ShareSubmission) -> ShareData {
        ShareData {
            job_id: submission.job_id.clone(),
            ip: submission.ip.clone(),
            worker: submission.worker.clone(),
            height: job.map(|j| j.height()).unwrap_or_default(),
            block_reward: job.map(|j| j.template().coinbasevalue).unwrap_or_default(),
            difficulty: submission.difficulty,
            share_diff: 0.0,
            block_diff: job.map(|j| j.block_diff()).unwrap_or_default(),
            block_hash: None,
            error: None,
        }
    }
}

#[async_trait]
impl JobManager for TemplateJobManager {
    async fn process_template(&self, template: BlockTemplate, public_key: &PublicKeyBuffer) -> Result<bool> {
        // Held until the job is installed so concurrent fetches of one tip yield one job
        let mut current = self.current_job.write().await;
        if let Some(job) = current.as_ref() {
            if job.previous_block_hash() == template.previousblockhash {
                return Ok(false);
            }
            // Out-of-sync node answered with an older tip
            if template.height < job.height() {
                debug!("Ignoring template at height {} below current {}", template.height, job.height());
                return Ok(false);
            }
        }

        let job = Arc::new(MiningJob::new(
            self.next_job_id(),
            template,
            public_key,
            EXTRA_NONCE1_SIZE + self.config.extra_nonce2_size,
            &self.config.coinbase_signature,
        )?);

        {
            let mut valid_jobs = self.valid_jobs.write().await;
            valid_jobs.clear();
            valid_jobs.insert(job.job_id().to_string(), Arc::clone(&job));
        }
        self.validator.clear().await;
        *current = Some(Arc::clone(&job));

        info!("New job {} at height {}", job.job_id(), job.height());
        let _ = self.events.send(JobEvent::NewJob(job.job_params()));
        Ok(true)
    }

    async fn process_share(&self, submission: ShareSubmission) -> ShareResponse {
        let job = self.valid_jobs.read().await.get(&submission.job_id).cloned();

        let Some(job) = job else {
            let mut data = self.share_data(None, &submission);
            let error = StratumError::job_not_found();
            data.error = Some(error.message.clone());
            self.emit_share(data, None);
            return ShareResponse::rejected(error);
        };

        let mut data = self.share_data(Some(&job), &submission);

        match self.validator.validate(&job, &submission).await {
            Ok(ValidatedShare { share_diff, block }) => {
                data.share_diff = share_diff;
                let block_hex = block.map(|candidate| {
                    data.block_hash = Some(candidate.hash);
                    candidate.hex
                });
                self.emit_share(data, block_hex);
                ShareResponse::accepted(share_diff)
            }
            Err(ShareRejection { error, share_diff }) => {
                data.share_diff = share_diff;
                data.error = Some(error.message.clone());
                self.emit_share(data, None);
                ShareResponse::rejected(error)
            }
        }
    }

    fn next_extra_nonce1(&self) -> String {
        self.extra_nonce_counter.next()
    }

    fn extra_nonce2_size(&self) -> usize {
        self.config.extra_nonce2_size
    }

    async fn current_job(&self) -> Option<CurrentJob> {
        self.current_job
            .read()
            .await
            .as_ref()
            .map(|job| CurrentJob::new(job.job_params(), job.previous_block_hash()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    const PREV_A: &str = "00000000000000000001b5fb4bd54b4ab6fa4b5c5ab0c41e42d3fb7f1b8a2c3d";
    const PREV_B: &str = "0000000000000000000320283a032748cef8227873ff4872689bf23f1cda83a5";

    fn create_test_template(previous: &str, height: u64) -> BlockTemplate {
        BlockTemplate {
            version: 0x20000000,
            previousblockhash: previous.to_string(),
            transactions: vec![],
            coinbaseaux: Default::default(),
            coinbasevalue: 312_500_000,
            target: None,
            mintime: 0,
            curtime: chrono::Utc::now().timestamp() as u32 - 60,
            bits: "1d00ffff".to_string(),
            height,
            default_witness_commitment: None,
        }
    }

    fn create_reward() -> PublicKeyBuffer {
        PublicKeyBuffer::from_script(ScriptBuf::from_bytes(vec![0x51]))
    }

    fn create_submission(job_id: &str, extra_nonce1: &str, ntime: u32) -> ShareSubmission {
        ShareSubmission {
            job_id: job_id.to_string(),
            difficulty: 1e-12,
            extra_nonce1: extra_nonce1.to_string(),
            extra_nonce2: "00000001".to_string(),
            ntime: format!("{:08x}", ntime),
            nonce: "0000abcd".to_string(),
            ip: "10.0.0.5".to_string(),
            worker: "alice.rig1".to_string(),
        }
    }

    #[test]
    fn test_extra_nonce_counter() {
        let counter = ExtraNonceCounter::new(Some(1));
        assert_eq!(counter.next(), "08000001");
        assert_eq!(counter.next(), "08000002");

        let random = ExtraNonceCounter::new(None);
        assert_eq!(random.next().len(), EXTRA_NONCE1_SIZE * 2);
    }

    #[tokio::test]
    async fn test_new_job_only_on_new_previous_hash() {
        let (manager, mut events) = TemplateJobManager::new(JobConfig::default());
        assert!(manager.current_job().await.is_none());

        assert!(manager.process_template(create_test_template(PREV_A, 100), &create_reward()).await.unwrap());
        let first = match events.try_recv().unwrap() {
            JobEvent::NewJob(params) => params,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(manager.current_job().await.unwrap().previous_block_hash(), PREV_A);

        // Same tip: no new job
        assert!(!manager.process_template(create_test_template(PREV_A, 100), &create_reward()).await.unwrap());
        assert!(events.try_recv().is_err());

        // Stale tip from a lagging node: ignored
        assert!(!manager.process_template(create_test_template(PREV_B, 99), &create_reward()).await.unwrap());

        assert!(manager.process_template(create_test_template(PREV_B, 101), &create_reward()).await.unwrap());
        match events.try_recv().unwrap() {
            JobEvent::NewJob(params) => assert_ne!(params.job_id, first.job_id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_job_rejected_and_reported() {
        let (manager, mut events) = TemplateJobManager::new(JobConfig::default());

        let response = manager.process_share(create_submission("ff", "08000001", 0)).await;
        assert_eq!(response.error.unwrap().code, 21);
        assert!(response.result.is_none());

        match events.try_recv().unwrap() {
            JobEvent::Share { data, block_hex } => {
                assert_eq!(data.error.as_deref(), Some("job not found"));
                assert_eq!(data.worker, "alice.rig1");
                assert!(block_hex.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_valid_share_reported() {
        let (manager, mut events) = TemplateJobManager::new(JobConfig::default());
        let template = create_test_template(PREV_A, 100);
        let ntime = template.curtime;
        manager.process_template(template, &create_reward()).await.unwrap();
        let params = match events.try_recv().unwrap() {
            JobEvent::NewJob(params) => params,
            other => panic!("unexpected event {:?}", other),
        };

        let extra_nonce1 = manager.next_extra_nonce1();
        let response = manager.process_share(create_submission(&params.job_id, &extra_nonce1, ntime)).await;
        assert!(response.error.is_none());
        assert!(response.result.is_some());

        match events.try_recv().unwrap() {
            JobEvent::Share { data, block_hex } => {
                assert!(data.is_valid());
                assert_eq!(data.height, 100);
                assert_eq!(data.block_reward, 312_500_000);
                assert!(data.share_diff > 0.0);
                assert!(block_hex.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Resubmitting the same work is a duplicate
        let response = manager.process_share(create_submission(&params.job_id, &extra_nonce1, ntime)).await;
        assert_eq!(response.error.unwrap().code, 22);
    }

    #[tokio::test]
    async fn test_jobs_from_previous_tip_become_invalid() {
        let (manager, mut events) = TemplateJobManager::new(JobConfig::default());
        manager.process_template(create_test_template(PREV_A, 100), &create_reward()).await.unwrap();
        let old = match events.try_recv().unwrap() {
            JobEvent::NewJob(params) => params,
            other => panic!("unexpected event {:?}", other),
        };
        manager.process_template(create_test_template(PREV_B, 101), &create_reward()).await.unwrap();

        let response = manager.process_share(create_submission(&old.job_id, "08000001", 0)).await;
        assert_eq!(response.error.unwrap().code, 21);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetches_of_one_tip_create_one_job() {
        for round in 0..200u64 {
            let (manager, mut events) = TemplateJobManager::new(JobConfig::default());
            let manager = Arc::new(manager);
            let previous = format!("{:064x}", round + 1);

            let fetches: Vec<_> = (0..2)
                .map(|_| {
                    let manager = Arc::clone(&manager);
                    let template = create_test_template(&previous, 100);
                    tokio::spawn(async move { manager.process_template(template, &create_reward()).await.unwrap() })
                })
                .collect();

            let mut created = 0;
            for fetch in fetches {
                if fetch.await.unwrap() {
                    created += 1;
                }
            }
            assert_eq!(created, 1, "round {}", round);

            let mut new_jobs = 0;
            while let Ok(event) = events.try_recv() {
                if matches!(event, JobEvent::NewJob(_)) {
                    new_jobs += 1;
                }
            }
            assert_eq!(new_jobs, 1, "round {}", round);
        }
    }
}
