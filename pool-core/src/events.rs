use crate::types::ShareData;
use serde::Serialize;
use tokio::sync::mpsc;

/// Severity of a pool log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Warning,
    Error,
}

/// Log categories used by the orchestrator
pub mod category {
    pub const SYSTEM: &str = "system";
    pub const SUBMITBLOCK: &str = "submitblock";
    pub const CHECKBLOCK: &str = "checkblock";
    pub const CLIENT: &str = "client";
}

/// Event stream exposed by the pool to its host process
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Log {
        level: LogLevel,
        category: String,
        message: String,
    },
    /// Final outcome of a share, emitted exactly once per share
    Share {
        valid_share: bool,
        valid_block: bool,
        data: ShareData,
    },
    /// The Stratum server is accepting miners
    Started,
}

pub type PoolEventReceiver = mpsc::UnboundedReceiver<PoolEvent>;

/// Cloneable emitter for pool events
#[derive(Debug, Clone)]
pub struct PoolEventSender {
    tx: mpsc::UnboundedSender<PoolEvent>,
}

impl PoolEventSender {
    /// Create a new event channel
    pub fn channel() -> (Self, PoolEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn log(&self, level: LogLevel, category: &str, message: impl Into<String>) {
        self.emit(PoolEvent::Log {
            level,
            category: category.to_string(),
            message: message.into(),
        });
    }

    pub fn debug(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, category, message);
    }

    pub fn warning(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Warning, category, message);
    }

    pub fn error(&self, category: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, category, message);
    }

    pub fn share(&self, valid_share: bool, valid_block: bool, data: ShareData) {
        self.emit(PoolEvent::Share { valid_share, valid_block, data });
    }

    pub fn started(&self) {
        self.emit(PoolEvent::Started);
    }

    fn emit(&self, event: PoolEvent) {
        // Nobody listening is not an error for the pool
        let _ = self.tx.send(event);
    }
}
