use crate::{Result, Error};
use crate::reward::RewardType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name, used in log lines
    pub name: String,
    /// Proof-of-work algorithm; only sha256d is supported
    pub algorithm: String,
    /// Address that receives block rewards
    pub address: String,
    /// How the reward output script is derived from the address
    pub reward: RewardType,
    /// Port the Stratum server listens on
    pub stratum_port: u16,
    /// Starting difficulty pushed to each miner
    pub difficulty: f64,
    /// Template polling interval in seconds, 0 disables polling
    pub block_refresh_interval: u64,
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub block_notify: BlockNotifyConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node RPC connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Per-request timeout in seconds
    pub timeout: u64,
    /// Liveness probes attempted before the daemon is declared failed
    pub connect_attempts: u32,
    /// Seconds between liveness probes
    pub retry_interval: u64,
}

/// Job manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    /// Fixed instance id for extranonce1 allocation, random when unset
    pub extra_nonce1_instance: Option<u32>,
    /// Bytes of extranonce2 rolled by miners
    pub extra_nonce2_size: usize,
    /// Text pushed into every coinbase script
    pub coinbase_signature: String,
}

/// External block notification listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockNotifyConfig {
    pub enabled: bool,
    pub bind_address: SocketAddr,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub metrics_bind_address: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    pub level: String,
    /// Per-component log levels
    pub component_levels: HashMap<String, String>,
    /// Output format (json, pretty, compact)
    pub format: LogFormat,
    /// Log output destination
    pub output: LogOutput,
    /// Whether to redact sensitive data
    pub redact_sensitive_data: bool,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Log output options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            algorithm: "sha256d".to_string(),
            address: String::new(),
            reward: RewardType::Pow,
            stratum_port: 3333,
            difficulty: 8.0,
            block_refresh_interval: 1,
            daemon: DaemonConfig::default(),
            job: JobConfig::default(),
            block_notify: BlockNotifyConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8332,
            user: String::new(),
            password: String::new(),
            timeout: 30,
            connect_attempts: 10,
            retry_interval: 5,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            extra_nonce1_instance: None,
            extra_nonce2_size: 4,
            coinbase_signature: "/poold/".to_string(),
        }
    }
}

impl Default for BlockNotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8117)),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_bind_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            component_levels: HashMap::new(),
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            redact_sensitive_data: true,
        }
    }
}

impl DaemonConfig {
    /// JSON-RPC endpoint of the node
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl PoolConfig {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_pool()?;
        self.validate_daemon()?;
        self.validate_job()?;
        self.validate_logging()?;
        self.validate_dependencies()?;
        Ok(())
    }

    fn validate_pool(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("Pool name cannot be empty".to_string()));
        }

        if self.algorithm != "sha256d" {
            return Err(Error::Config(format!("Unsupported algorithm: {}", self.algorithm)));
        }

        if self.address.is_empty() {
            return Err(Error::Config("Pool address cannot be empty".to_string()));
        }

        if !(self.difficulty > 0.0) {
            return Err(Error::Config("difficulty must be greater than 0".to_string()));
        }

        Ok(())
    }

    fn validate_daemon(&self) -> Result<()> {
        if self.daemon.host.is_empty() {
            return Err(Error::Config("Daemon host cannot be empty".to_string()));
        }

        if self.daemon.timeout == 0 {
            return Err(Error::Config("Daemon timeout must be greater than 0".to_string()));
        }

        if self.daemon.connect_attempts == 0 {
            return Err(Error::Config("Daemon connect_attempts must be greater than 0".to_string()));
        }

        Ok(())
    }

    fn validate_job(&self) -> Result<()> {
        if !(1..=8).contains(&self.job.extra_nonce2_size) {
            return Err(Error::Config(format!(
                "extra_nonce2_size must be between 1 and 8, got {}",
                self.job.extra_nonce2_size
            )));
        }

        // Coinbase scriptSig is capped at 100 bytes, leave room for height and extranonce
        if self.job.coinbase_signature.len() > 64 {
            return Err(Error::Config("coinbase_signature cannot exceed 64 bytes".to_string()));
        }

        Ok(())
    }

    fn validate_logging(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!("Invalid log level: {}. Must be one of: {:?}", self.logging.level, valid_levels)));
        }

        Ok(())
    }

    /// Validate dependencies between different configuration sections
    fn validate_dependencies(&self) -> Result<()> {
        if self.monitoring.enable_metrics {
            if self.monitoring.metrics_bind_address.port() == self.stratum_port {
                return Err(Error::Config("Metrics bind address cannot use the stratum port".to_string()));
            }
        }

        if self.block_notify.enabled {
            if self.block_notify.bind_address.port() == self.stratum_port {
                return Err(Error::Config("Block notify bind address cannot use the stratum port".to_string()));
            }
        }

        if let LogOutput::File(ref path) = self.logging.output {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    return Err(Error::Config(format!("Log directory does not exist: {}", parent.display())));
                }
            }
        }

        Ok(())
    }

    /// Merge with environment variables
    pub fn merge_env(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var("POOLD_NAME") {
            self.name = name;
        }

        if let Ok(address) = std::env::var("POOLD_ADDRESS") {
            self.address = address;
        }

        if let Ok(reward) = std::env::var("POOLD_REWARD") {
            self.reward = reward.parse()?;
        }

        if let Ok(port) = std::env::var("POOLD_STRATUM_PORT") {
            self.stratum_port = port.parse()
                .map_err(|e| Error::Config(format!("Invalid stratum port: {}", e)))?;
        }

        if let Ok(difficulty) = std::env::var("POOLD_DIFFICULTY") {
            self.difficulty = difficulty.parse()
                .map_err(|e| Error::Config(format!("Invalid difficulty: {}", e)))?;
        }

        if let Ok(interval) = std::env::var("POOLD_BLOCK_REFRESH_INTERVAL") {
            self.block_refresh_interval = interval.parse()
                .map_err(|e| Error::Config(format!("Invalid block refresh interval: {}", e)))?;
        }

        // Daemon configuration
        if let Ok(host) = std::env::var("POOLD_DAEMON_HOST") {
            self.daemon.host = host;
        }

        if let Ok(port) = std::env::var("POOLD_DAEMON_PORT") {
            self.daemon.port = port.parse()
                .map_err(|e| Error::Config(format!("Invalid daemon port: {}", e)))?;
        }

        if let Ok(user) = std::env::var("POOLD_DAEMON_USER") {
            self.daemon.user = user;
        }

        if let Ok(password) = std::env::var("POOLD_DAEMON_PASSWORD") {
            self.daemon.password = password;
        }

        // Logging configuration
        if let Ok(log_level) = std::env::var("POOLD_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Load configuration with environment variable override
    pub fn load_with_env(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
        } else {
            Self::default()
        };

        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }
}
