use thiserror::Error;

use crate::executor::StageFailure;

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("Failed to read or write a local file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the configuration file: {0}")]
    Conf(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConf(String),
    #[error(transparent)]
    Stage(#[from] StageFailure),
    #[error("Pipeline cancelled")]
    Cancelled,
}
