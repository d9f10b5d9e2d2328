use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::process::Command;

use crate::config::DockerConfig;
use crate::worker::provider::{ProviderError, ProviderWorker, WorkerProvider};
use crate::worker::registry::{WorkerId, WorkerStatus};

/// Length of the short container id, which docker also uses as the hostname.
const SHORT_ID_LEN: usize = 12;

/// Runs each worker as a detached Docker container.
///
/// Containers are labelled with the scheduler identity so a restarted
/// scheduler can find the workers it launched with `docker ps`.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    config: DockerConfig,
    scheduler_id: String,
}

impl DockerProvider {
    pub fn new(config: DockerConfig, scheduler_id: impl Into<String>) -> Self {
        Self {
            config,
            scheduler_id: scheduler_id.into(),
        }
    }

    fn owner_label(&self) -> String {
        format!("{}={}", self.config.label_key, self.scheduler_id)
    }

    /// Arguments for `docker run`, image and command last.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];

        args.push(format!("--label={}", self.owner_label()));

        if self.config.remove_on_exit {
            args.push("--rm".to_string());
        }

        if let Some(ref network) = self.config.network {
            args.push(format!("--network={}", network));
        }

        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push(format!("--env=JOBFLEET_SCHEDULER_ID={}", self.scheduler_id));
        for (key, value) in &self.config.env {
            args.push(format!("--env={}={}", key, value));
        }

        args.push(self.config.image.clone());
        args.extend(self.config.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<Output, std::io::Error> {
        Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }
}

#[async_trait]
impl WorkerProvider for DockerProvider {
    async fn launch(&self) -> Result<WorkerId, ProviderError> {
        let args = self.run_args();
        tracing::debug!(image = %self.config.image, "Launching worker container");

        let output = self.docker(&args).await.map_err(spawn_error)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProviderError::Launch {
                retryable: launch_retryable(&stderr),
                reason: if stderr.is_empty() {
                    format!("docker run exited with {:?}", output.status.code())
                } else {
                    stderr
                },
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = short_id(stdout.trim());
        if id.is_empty() {
            return Err(ProviderError::Launch {
                reason: "docker run returned no container id".to_string(),
                retryable: true,
            });
        }
        Ok(id)
    }

    async fn describe(&self, id: &str) -> Result<WorkerStatus, ProviderError> {
        let args = [
            "inspect".to_string(),
            "--format={{.State.Status}}".to_string(),
            id.to_string(),
        ];
        let output = self.docker(&args).await.map_err(unavailable)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Err(ProviderError::NotFound(id.to_string()));
            }
            return Err(ProviderError::Unavailable(stderr.trim().to_string()));
        }
        Ok(parse_state(String::from_utf8_lossy(&output.stdout).trim()))
    }

    async fn stop(&self, id: &str) -> Result<(), ProviderError> {
        let args = ["stop".to_string(), id.to_string()];
        let output = self.docker(&args).await.map_err(|e| ProviderError::Stop {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            // already gone counts as stopped
            return Ok(());
        }
        Err(ProviderError::Stop {
            id: id.to_string(),
            reason: stderr.trim().to_string(),
        })
    }

    async fn list_owned(&self) -> Result<Vec<ProviderWorker>, ProviderError> {
        let args = [
            "ps".to_string(),
            "--all".to_string(),
            "--no-trunc".to_string(),
            format!("--filter=label={}", self.owner_label()),
            "--format={{.ID}}\t{{.State}}\t{{.CreatedAt}}".to_string(),
        ];
        let output = self.docker(&args).await.map_err(unavailable)?;
        if !output.status.success() {
            return Err(ProviderError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_ps_line)
            .collect())
    }
}

fn spawn_error(e: std::io::Error) -> ProviderError {
    ProviderError::Launch {
        // a missing docker binary will not fix itself
        retryable: e.kind() != std::io::ErrorKind::NotFound,
        reason: e.to_string(),
    }
}

fn unavailable(e: std::io::Error) -> ProviderError {
    ProviderError::Unavailable(e.to_string())
}

fn short_id(id: &str) -> WorkerId {
    id.chars().take(SHORT_ID_LEN).collect()
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

/// Image and argument problems recur on every attempt; daemon trouble does not.
fn launch_retryable(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    let permanent = [
        "unable to find image",
        "pull access denied",
        "invalid reference format",
        "unknown flag",
        "invalid argument",
    ];
    !permanent.iter().any(|p| stderr.contains(p))
}

/// Map a docker container state onto a worker status.
pub fn parse_state(state: &str) -> WorkerStatus {
    match state.trim().to_ascii_lowercase().as_str() {
        "created" | "restarting" => WorkerStatus::Pending,
        "running" | "paused" => WorkerStatus::Running,
        "exited" | "dead" | "removing" => WorkerStatus::Stopped,
        _ => WorkerStatus::Unknown,
    }
}

/// Parse one `docker ps` line of the form `ID\tSTATE\tCREATED_AT`.
fn parse_ps_line(line: &str) -> Option<ProviderWorker> {
    let mut fields = line.split('\t');
    let id = short_id(fields.next()?.trim());
    if id.is_empty() {
        return None;
    }
    let status = parse_state(fields.next().unwrap_or_default());
    let launched_at = fields
        .next()
        .and_then(parse_created_at)
        .unwrap_or_else(Utc::now);
    Some(ProviderWorker {
        id,
        status,
        launched_at,
    })
}

/// Docker prints e.g. `2024-05-01 12:30:45 +0000 UTC`; the zone name is dropped.
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let offset = parts.next()?;
    DateTime::parse_from_str(&format!("{date} {time} {offset}"), "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
