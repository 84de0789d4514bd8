use thiserror::Error;

use crate::broker::BrokerError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Broker unavailable after {failures} consecutive poll failures: {last_error}")]
    BrokerUnavailable { failures: u32, last_error: String },

    #[error("Channel {0} stopped unexpectedly")]
    ChannelClosed(usize),

    #[error("Health server error: {0}")]
    HealthServer(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
