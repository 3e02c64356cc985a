//! Queue configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which backend a process runs, derived from whether a broker URL is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Redis Streams, shared by every process
    Distributed,
    /// In-process queue, no external dependency
    Fallback,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Distributed => "distributed",
            QueueMode::Fallback => "fallback",
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a process serves the API, runs workers, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessRole {
    /// Accept enqueue requests and run workers
    #[default]
    All,
    /// Accept enqueue requests only
    Api,
    /// Run workers only
    Worker,
}

impl ProcessRole {
    pub fn serves_api(&self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Api)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Worker)
    }
}

impl FromStr for ProcessRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(ProcessRole::All),
            "api" => Ok(ProcessRole::Api),
            "worker" => Ok(ProcessRole::Worker),
            other => Err(format!("invalid process role: {}", other)),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL; `None` selects the in-process fallback
    pub redis_url: Option<String>,
    /// Prefix for every Redis key and channel
    pub key_prefix: String,
    /// Process role
    pub role: ProcessRole,
    /// Maximum simultaneously active jobs in this process
    pub concurrency: usize,
    /// Maximum waiting jobs in the in-process queue
    pub max_queue_len: usize,
    /// Stall requeues before a job fails with StalledJobExceeded
    pub max_stalled_retries: u32,
    /// Lifetime of a worker's claim on a job without heartbeat
    pub lease_ttl: Duration,
    /// Interval between lease refreshes while a job runs
    pub heartbeat_interval: Duration,
    /// Interval between scans for stalled jobs
    pub claim_interval: Duration,
    /// How long finished jobs and their logs are kept; zero keeps them forever
    pub retention: Duration,
    /// Interval between log sink flushes
    pub log_flush_interval: Duration,
    /// Time allowed for in-flight jobs to drain on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "basejobs".to_string(),
            role: ProcessRole::All,
            concurrency: 1,
            max_queue_len: 1000,
            max_stalled_retries: 3,
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            claim_interval: Duration::from_secs(30),
            retention: Duration::from_secs(86400), // 24 hours
            log_flush_interval: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let redis_url = std::env::var("JOBS_REDIS_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .ok()
            .filter(|s| !s.trim().is_empty());

        let worker_container = std::env::var("JOBS_WORKER_CONTAINER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let role = if worker_container {
            ProcessRole::Worker
        } else {
            std::env::var("JOBS_ROLE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.role)
        };

        Self {
            redis_url,
            key_prefix: std::env::var("JOBS_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            role,
            concurrency: std::env::var("JOBS_WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            max_queue_len: std::env::var("JOBS_MAX_QUEUE_LEN")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_queue_len),
            max_stalled_retries: std::env::var("JOBS_MAX_STALLED_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_stalled_retries),
            lease_ttl: Duration::from_secs(
                std::env::var("JOBS_LEASE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("JOBS_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20),
            ),
            claim_interval: Duration::from_secs(
                std::env::var("JOBS_CLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            retention: Duration::from_secs(
                std::env::var("JOBS_RETENTION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(86400),
            ),
            log_flush_interval: Duration::from_millis(
                std::env::var("JOBS_LOG_FLUSH_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1000),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("JOBS_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }

    /// Backend selected by this configuration.
    pub fn mode(&self) -> QueueMode {
        if self.redis_url.is_some() {
            QueueMode::Distributed
        } else {
            QueueMode::Fallback
        }
    }

    /// Redis key for a name under the configured prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}:{}", self.key_prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_fallback() {
        let config = QueueConfig::default();
        assert_eq!(config.mode(), QueueMode::Fallback);
        assert_eq!(config.concurrency, 1);
        assert!(config.heartbeat_interval < config.lease_ttl);
    }

    #[test]
    fn test_redis_url_selects_distributed() {
        let config = QueueConfig {
            redis_url: Some("redis://localhost:6379".to_string()),
            ..Default::default()
        };
        assert_eq!(config.mode(), QueueMode::Distributed);
        assert_eq!(config.key("jobs"), "basejobs:jobs");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("worker".parse::<ProcessRole>().unwrap(), ProcessRole::Worker);
        assert_eq!("API".parse::<ProcessRole>().unwrap(), ProcessRole::Api);
        assert!("both".parse::<ProcessRole>().is_err());
        assert!(ProcessRole::All.serves_api() && ProcessRole::All.runs_workers());
        assert!(!ProcessRole::Worker.serves_api());
        assert!(!ProcessRole::Api.runs_workers());
    }
}
