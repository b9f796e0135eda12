use crate::error::Result;
use crate::events::{LogLevel, PoolEvent};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// Prometheus metrics derived from the pool event stream
#[derive(Debug)]
pub struct PoolMetrics {
    registry: Registry,
    shares_accepted: IntCounter,
    shares_rejected: IntCounter,
    blocks_found: IntCounter,
    blocks_rejected: IntCounter,
    share_difficulty: Histogram,
    log_events: IntCounterVec,
    stratum_started: IntGauge,
    start_time: Instant,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub blocks_found: u64,
    pub blocks_rejected: u64,
    pub stratum_started: bool,
    pub uptime_seconds: u64,
}

impl PoolMetrics {
    /// Create metrics labelled with the pool name
    pub fn new(pool_name: &str) -> Result<Self> {
        let registry = Registry::new();
        let labels: HashMap<String, String> = HashMap::from([("pool".to_string(), pool_name.to_string())]);

        let shares_accepted = IntCounter::with_opts(
            Opts::new("pool_shares_accepted_total", "Shares accepted")
                .const_labels(labels.clone())
        )?;
        let shares_rejected = IntCounter::with_opts(
            Opts::new("pool_shares_rejected_total", "Shares rejected")
                .const_labels(labels.clone())
        )?;
        let blocks_found = IntCounter::with_opts(
            Opts::new("pool_blocks_found_total", "Blocks accepted by the node")
                .const_labels(labels.clone())
        )?;
        let blocks_rejected = IntCounter::with_opts(
            Opts::new("pool_blocks_rejected_total", "Block candidates the node did not accept")
                .const_labels(labels.clone())
        )?;
        let share_difficulty = Histogram::with_opts(
            HistogramOpts::new("pool_share_difficulty", "Difficulty reached by accepted shares")
                .const_labels(labels.clone())
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 100000.0, 1000000.0])
        )?;
        let log_events = IntCounterVec::new(
            Opts::new("pool_log_events_total", "Pool log events by level and category")
                .const_labels(labels.clone()),
            &["level", "category"],
        )?;
        let stratum_started = IntGauge::with_opts(
            Opts::new("pool_stratum_started", "1 once the Stratum server accepts miners")
                .const_labels(labels)
        )?;

        registry.register(Box::new(shares_accepted.clone()))?;
        registry.register(Box::new(shares_rejected.clone()))?;
        registry.register(Box::new(blocks_found.clone()))?;
        registry.register(Box::new(blocks_rejected.clone()))?;
        registry.register(Box::new(share_difficulty.clone()))?;
        registry.register(Box::new(log_events.clone()))?;
        registry.register(Box::new(stratum_started.clone()))?;

        Ok(Self {
            registry,
            shares_accepted,
            shares_rejected,
            blocks_found,
            blocks_rejected,
            share_difficulty,
            log_events,
            stratum_started,
            start_time: Instant::now(),
        })
    }

    /// Update counters from a pool event
    pub fn record_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::Share { valid_share, valid_block, data } => {
                if *valid_share {
                    self.shares_accepted.inc();
                    self.share_difficulty.observe(data.share_diff);
                } else {
                    self.shares_rejected.inc();
                }

                if *valid_block {
                    self.blocks_found.inc();
                } else if data.block_hash.is_some() {
                    self.blocks_rejected.inc();
                }
            }
            PoolEvent::Log { level, category, .. } => {
                let level = match level {
                    LogLevel::Debug => "debug",
                    LogLevel::Warning => "warning",
                    LogLevel::Error => "error",
                };
                self.log_events.with_label_values(&[level, category.as_str()]).inc();
            }
            PoolEvent::Started => self.stratum_started.set(1),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Metrics(e.to_string()))
    }

    pub fn get_summary(&self) -> MetricsSummary {
        MetricsSummary {
            shares_accepted: self.shares_accepted.get(),
            shares_rejected: self.shares_rejected.get(),
            blocks_found: self.blocks_found.get(),
            blocks_rejected: self.blocks_rejected.get(),
            stratum_started: self.stratum_started.get() == 1,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}
