use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency ceiling must be greater than zero")]
    ZeroCeiling,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("scheduler id must not be empty")]
    EmptySchedulerId,

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// What happens to live workers when the scheduler stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Leave workers running for the next scheduler instance to adopt.
    #[default]
    Leave,
    /// Issue a stop for every active worker before exiting.
    Drain,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity tag applied to every launched worker. Restarted instances
    /// adopt workers carrying the same tag.
    pub scheduler_id: String,
    /// Maximum number of simultaneously active workers.
    pub concurrency_ceiling: usize,
    /// Wait between the end of one tick and the start of the next.
    pub poll_interval: Duration,
    /// Upper bound on any single store or provider call.
    pub call_timeout: Duration,
    /// Re-issue a stop if the worker still isn't stopped after this long.
    pub stop_retry_after: Duration,
    pub shutdown: ShutdownPolicy,
    /// Rebuild the registry from the provider before the first tick.
    pub recover_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_id: "jobfleet".to_string(),
            concurrency_ceiling: 2,
            poll_interval: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            stop_retry_after: Duration::from_secs(300),
            shutdown: ShutdownPolicy::Leave,
            recover_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn new(scheduler_id: impl Into<String>, concurrency_ceiling: usize) -> Self {
        Self {
            scheduler_id: scheduler_id.into(),
            concurrency_ceiling,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler_id.trim().is_empty() {
            return Err(ConfigError::EmptySchedulerId);
        }
        if self.concurrency_ceiling == 0 {
            return Err(ConfigError::ZeroCeiling);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll_interval"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("call_timeout"));
        }
        Ok(())
    }
}

/// Container settings for the Docker worker provider.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Worker image to run
    pub image: String,
    /// Optional command override appended after the image
    pub command: Vec<String>,
    /// Docker network to attach workers to (e.g., "bridge")
    pub network: Option<String>,
    /// Memory limit (e.g., "512m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "1.0")
    pub cpu_limit: Option<String>,
    /// Extra environment passed to every worker
    pub env: Vec<(String, String)>,
    /// Label key carrying the scheduler identity
    pub label_key: String,
    /// Let docker delete containers once they exit
    pub remove_on_exit: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "jobfleet-worker:latest".to_string(),
            command: Vec::new(),
            network: None,
            memory_limit: Some("512m".to_string()),
            cpu_limit: Some("1.0".to_string()),
            env: Vec::new(),
            label_key: "jobfleet.scheduler".to_string(),
            remove_on_exit: false,
        }
    }
}

/// Which worker provider the process drives.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    Docker(DockerConfig),
    /// Simulated in-process workers, for dry runs.
    Memory,
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub provider: ProviderConfig,
    /// SQLite database holding the jobs table.
    pub database: PathBuf,
    pub dashboard_addr: Option<SocketAddr>,
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if let ProviderConfig::Docker(docker) = &self.provider {
            if docker.image.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    name: "image",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                name: "database",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
