//! # Constants
//!
//! Shared constants used throughout the daemon.
//!
//! These values represent reasonable defaults and can be overridden via
//! environment variables where applicable.

/// Application name, also the value of the `manager` ownership label
pub const APP_NAME: &str = "doco-cd";

/// Application version baked in at compile time
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 40 hexadecimal zeros, "no commit" in push payloads
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Sentinel commit value recorded for poll-triggered jobs
pub const POLL_TRIGGER: &str = "poll";

/// Default HTTP port for webhooks and the management API
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default port for the Prometheus metrics endpoint
pub const DEFAULT_METRICS_PORT: u16 = 9120;

/// Default global deployment concurrency
pub const DEFAULT_MAX_CONCURRENT_DEPLOYMENTS: usize = 4;

/// Default TTL for idle repository locks and limiter entries (seconds)
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 180;

/// Default webhook body size cap (bytes)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1_048_576;

/// Default consecutive-same-commit threshold before a forced recreate.
/// Zero disables loop detection entirely.
pub const DEFAULT_MAX_DEPLOYMENT_LOOPS: u32 = 3;

/// Default directory inside a repository that holds deploy-config files
pub const DEFAULT_DEPLOY_CONFIG_DIR: &str = ".doco-cd";

/// Default poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 180;

/// Default data mount root holding repository clones
pub const DEFAULT_DATA_MOUNT_POINT: &str = "/data";

/// Default wait for service convergence after an apply (seconds)
pub const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 300;

/// Deadline for a single notification send
pub const NOTIFICATION_TIMEOUT_SECS: u64 = 5;

/// Retry budget for removing volumes that are still in use after a destroy
pub const VOLUME_REMOVE_RETRIES: u32 = 5;

/// Delay between volume removal retries (seconds)
pub const VOLUME_REMOVE_RETRY_DELAY_SECS: u64 = 2;

/// Compose file names probed when a deploy-config does not list any
pub const DEFAULT_COMPOSE_FILE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Label keys attached to every managed resource.
///
/// The labels are the sole source of truth for ownership; the daemon never
/// stores deployment state on disk outside the git checkout.
pub mod labels {
    /// Ownership marker, always set to [`APP_NAME`](super::APP_NAME)
    pub const MANAGER: &str = "cd.doco.manager";
    pub const VERSION: &str = "cd.doco.version";
    pub const DEPLOYMENT_NAME: &str = "cd.doco.deployment.name";
    pub const TARGET_REF: &str = "cd.doco.deployment.target_ref";
    pub const COMMIT_SHA: &str = "cd.doco.deployment.commit_sha";
    pub const TRIGGER_COMMIT: &str = "cd.doco.deployment.trigger_commit";
    pub const TIMESTAMP: &str = "cd.doco.deployment.timestamp";
    pub const WORKING_DIR: &str = "cd.doco.deployment.working_dir";
    pub const EXTERNAL_SECRETS_HASH: &str = "cd.doco.deployment.external_secrets_hash";
    pub const AUTO_DISCOVER: &str = "cd.doco.deployment.auto_discover";
    pub const AUTO_DISCOVER_DELETE: &str = "cd.doco.deployment.auto_discover_delete";
    pub const REPOSITORY_NAME: &str = "cd.doco.repository.name";
    pub const REPOSITORY_URL: &str = "cd.doco.repository.url";
}
