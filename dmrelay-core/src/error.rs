use thiserror::Error;

use crate::models::RoomId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid cron expression {expression:?}: {source}")]
    Schedule {
        expression: String,
        source: cron::error::Error,
    },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Room {0} is currently unreachable: {1}")]
    RoomUnreachable(RoomId, String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
