//! Controller configuration
//!
//! Every setting is a command line flag that can also be set from the
//! environment, so the same binary runs unchanged in a container.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::remote::SshOptions;

#[derive(Debug, Clone, Parser)]
#[command(name = "fleetops-controller")]
#[command(about = "Batch operation controller for GPU fleets", long_about = None)]
pub struct ControllerConfig {
    /// Identifier of this controller instance, used in logs
    #[arg(long, env = "FLEETOPS_CONTROLLER_ID", default_value_t = uuid::Uuid::new_v4().to_string())]
    pub controller_id: String,

    /// Concurrent reconcile workers
    #[arg(long, env = "FLEETOPS_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Delay before retrying nodes that were deferred
    #[arg(long, env = "FLEETOPS_DEFER_INTERVAL_SECS", default_value_t = 5)]
    pub defer_interval_secs: u64,

    /// First delay of the per-node remote command retry
    #[arg(long, env = "FLEETOPS_RETRY_INITIAL_MS", default_value_t = 300)]
    pub retry_initial_ms: u64,

    /// Time budget of the per-node remote command retry
    #[arg(long, env = "FLEETOPS_RETRY_MAX_WAIT_MS", default_value_t = 3000)]
    pub retry_max_wait_ms: u64,

    /// First requeue delay after a failed reconcile
    #[arg(long, env = "FLEETOPS_REQUEUE_BASE_MS", default_value_t = 500)]
    pub requeue_base_ms: u64,

    /// Cap of the requeue delay after repeated failures
    #[arg(long, env = "FLEETOPS_REQUEUE_MAX_SECS", default_value_t = 60)]
    pub requeue_max_secs: u64,

    #[arg(long, env = "FLEETOPS_SSH_USER", default_value = "root")]
    pub ssh_user: String,

    #[arg(long, env = "FLEETOPS_SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,

    /// Private key passed to ssh with `-i`
    #[arg(long, env = "FLEETOPS_SSH_IDENTITY")]
    pub ssh_identity: Option<PathBuf>,

    #[arg(long, env = "FLEETOPS_SSH_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub ssh_connect_timeout_secs: u64,

    /// JSON snapshot seeding the in-memory store
    #[arg(long, env = "FLEETOPS_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Image of preflight and diagnose workloads without an `image` input
    #[arg(
        long,
        env = "FLEETOPS_WORKLOAD_IMAGE",
        default_value = "fleetops/node-check:latest"
    )]
    pub workload_image: String,
}

impl ControllerConfig {
    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }

        if self.retry_initial_ms == 0 {
            anyhow::bail!("retry_initial_ms must be greater than 0");
        }

        if self.retry_max_wait_ms < self.retry_initial_ms {
            anyhow::bail!("retry_max_wait_ms must not be smaller than retry_initial_ms");
        }

        if self.requeue_base_ms == 0 {
            anyhow::bail!("requeue_base_ms must be greater than 0");
        }

        if self.ssh_user.is_empty() {
            anyhow::bail!("ssh_user cannot be empty");
        }

        if self.ssh_port == 0 {
            anyhow::bail!("ssh_port must be greater than 0");
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_initial_ms),
            Duration::from_millis(self.retry_max_wait_ms),
        )
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity: self.ssh_identity.clone(),
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout_secs),
        }
    }

    pub fn defer_interval(&self) -> Duration {
        Duration::from_secs(self.defer_interval_secs)
    }

    pub fn requeue_base(&self) -> Duration {
        Duration::from_millis(self.requeue_base_ms)
    }

    pub fn requeue_max(&self) -> Duration {
        Duration::from_secs(self.requeue_max_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_id: uuid::Uuid::new_v4().to_string(),
            workers: 4,
            defer_interval_secs: 5,
            retry_initial_ms: 300,
            retry_max_wait_ms: 3000,
            requeue_base_ms: 500,
            requeue_max_secs: 60,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_identity: None,
            ssh_connect_timeout_secs: 10,
            state_file: None,
            workload_image: "fleetops/node-check:latest".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.defer_interval(), Duration::from_secs(5));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(Duration::from_millis(300), Duration::from_secs(3))
        );
        assert_eq!(
            config.retry_policy().backoff().max_elapsed_time,
            Some(Duration::from_secs(3))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_match_defaults() {
        let parsed = ControllerConfig::try_parse_from(["fleetops-controller"]).unwrap();
        let defaults = ControllerConfig::default();
        assert_eq!(parsed.workers, defaults.workers);
        assert_eq!(parsed.retry_max_wait_ms, defaults.retry_max_wait_ms);
        assert_eq!(parsed.ssh_user, defaults.ssh_user);
        assert_eq!(parsed.workload_image, defaults.workload_image);
        assert!(!parsed.controller_id.is_empty());
    }

    #[test]
    fn test_flags_override_defaults() {
        let parsed = ControllerConfig::try_parse_from([
            "fleetops-controller",
            "--workers",
            "8",
            "--ssh-user",
            "ops",
            "--ssh-identity",
            "/etc/fleetops/id_ed25519",
        ])
        .unwrap();
        assert_eq!(parsed.workers, 8);

        let ssh = parsed.ssh_options();
        assert_eq!(ssh.user, "ops");
        assert_eq!(
            ssh.identity,
            Some(PathBuf::from("/etc/fleetops/id_ed25519"))
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = ControllerConfig::default();

        // Valid config should pass
        assert!(config.validate().is_ok());

        config.workers = 0;
        assert!(config.validate().is_err());
        config.workers = 2;

        // Retry budget smaller than the first step
        config.retry_max_wait_ms = 100;
        assert!(config.validate().is_err());
        config.retry_max_wait_ms = 3000;

        config.ssh_user = String::new();
        assert!(config.validate().is_err());
        config.ssh_user = "root".to_string();

        config.ssh_port = 0;
        assert!(config.validate().is_err());
    }
}
