use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

impl FleetError {
    /// Configuration problems stop the process before the loop starts.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, FleetError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
