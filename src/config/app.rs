//! # Application Configuration
//!
//! Process-wide settings read once from environment variables at startup.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::constants;

/// Process-wide configuration.
///
/// Every field maps to one environment variable; defaults come from
/// [`crate::constants`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Tracing filter level (`LOG_LEVEL`)
    pub log_level: String,
    /// Webhook / management API port (`HTTP_PORT`)
    pub http_port: u16,
    /// Prometheus endpoint port (`METRICS_PORT`)
    pub metrics_port: u16,
    /// Shared secret for webhook signature verification (`WEBHOOK_SECRET`)
    pub webhook_secret: String,
    /// `X-API-Key` value required on `/v1/api/*` (`API_SECRET`)
    pub api_secret: String,
    /// HTTP(S) access token for private repositories (`GIT_ACCESS_TOKEN`)
    pub git_access_token: Option<String>,
    /// Username paired with the access token (`AUTH_TYPE`, default `oauth2`)
    pub auth_type: String,
    /// Private key file for SSH clone URLs (`SSH_KEY_PATH`)
    pub ssh_key_path: Option<PathBuf>,
    /// Disable TLS verification for git operations (`SKIP_TLS_VERIFICATION`)
    pub skip_tls_verification: bool,
    /// Bind-mounted data root holding repository clones (`DATA_MOUNT_POINT`)
    pub data_mount_point: PathBuf,
    /// Global deployment concurrency (`MAX_CONCURRENT_DEPLOYMENTS`)
    pub max_concurrent_deployments: usize,
    /// TTL for idle locks and limiter entries (`LOCK_TIMEOUT_SECONDS`)
    pub lock_timeout_secs: u64,
    /// Webhook body size cap in bytes (`MAX_PAYLOAD_SIZE`)
    pub max_payload_size: usize,
    /// Consecutive-same-commit threshold, 0 disables (`MAX_DEPLOYMENT_LOOPS`)
    pub max_deployment_loops: u32,
    /// Config base directory inside repositories (`DEPLOY_CONFIG_DIR`)
    pub deploy_config_dir: String,
    /// Notification endpoint, empty disables (`NOTIFY_URL`)
    pub notify_url: Option<String>,
    /// Minimum notification level actually sent (`NOTIFY_LEVEL`)
    pub notify_level: crate::notify::NotifyLevel,
    /// Poll-config YAML file, empty disables polling (`DOCO_CD_CONFIG_FILE`)
    pub poll_config_file: Option<PathBuf>,
    /// External-secret provider: `env` or `none` (`EXTERNAL_SECRETS_PROVIDER`)
    pub external_secrets_provider: String,
}

impl AppConfig {
    /// Read the configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first when present,
    /// so containerized and local runs share the same surface.
    pub fn from_env() -> Result<Self> {
        // Missing .env is the normal case in containers
        let _ = dotenvy::dotenv();

        let config = Self {
            log_level: env_or("LOG_LEVEL", "info"),
            http_port: parse_env("HTTP_PORT", constants::DEFAULT_HTTP_PORT)?,
            metrics_port: parse_env("METRICS_PORT", constants::DEFAULT_METRICS_PORT)?,
            webhook_secret: require_env("WEBHOOK_SECRET")?,
            api_secret: require_env("API_SECRET")?,
            git_access_token: non_empty_env("GIT_ACCESS_TOKEN"),
            auth_type: env_or("AUTH_TYPE", "oauth2"),
            ssh_key_path: non_empty_env("SSH_KEY_PATH").map(PathBuf::from),
            skip_tls_verification: parse_env("SKIP_TLS_VERIFICATION", false)?,
            data_mount_point: PathBuf::from(env_or(
                "DATA_MOUNT_POINT",
                constants::DEFAULT_DATA_MOUNT_POINT,
            )),
            max_concurrent_deployments: parse_env(
                "MAX_CONCURRENT_DEPLOYMENTS",
                constants::DEFAULT_MAX_CONCURRENT_DEPLOYMENTS,
            )?,
            lock_timeout_secs: parse_env(
                "LOCK_TIMEOUT_SECONDS",
                constants::DEFAULT_LOCK_TIMEOUT_SECS,
            )?,
            max_payload_size: parse_env("MAX_PAYLOAD_SIZE", constants::DEFAULT_MAX_PAYLOAD_SIZE)?,
            max_deployment_loops: parse_env(
                "MAX_DEPLOYMENT_LOOPS",
                constants::DEFAULT_MAX_DEPLOYMENT_LOOPS,
            )?,
            deploy_config_dir: env_or("DEPLOY_CONFIG_DIR", constants::DEFAULT_DEPLOY_CONFIG_DIR),
            notify_url: non_empty_env("NOTIFY_URL"),
            notify_level: env_or("NOTIFY_LEVEL", "error")
                .parse()
                .context("invalid NOTIFY_LEVEL")?,
            poll_config_file: non_empty_env("DOCO_CD_CONFIG_FILE").map(PathBuf::from),
            external_secrets_provider: env_or("EXTERNAL_SECRETS_PROVIDER", "env"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that fail fast at startup instead of mid-job.
    pub fn validate(&self) -> Result<()> {
        if self.webhook_secret.trim().is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must not be empty");
        }
        if self.api_secret.trim().is_empty() {
            anyhow::bail!("API_SECRET must not be empty");
        }
        if self.http_port == 0 {
            anyhow::bail!("HTTP_PORT must not be 0");
        }
        if self.metrics_port == 0 {
            anyhow::bail!("METRICS_PORT must not be 0");
        }
        if self.http_port == self.metrics_port {
            anyhow::bail!("HTTP_PORT and METRICS_PORT must differ");
        }
        if self.max_concurrent_deployments == 0 {
            anyhow::bail!("MAX_CONCURRENT_DEPLOYMENTS must be at least 1");
        }
        if self.max_payload_size == 0 {
            anyhow::bail!("MAX_PAYLOAD_SIZE must be at least 1 byte");
        }
        // A missing mount would otherwise only surface inside the first job
        if !self.data_mount_point.is_dir() {
            anyhow::bail!(
                "DATA_MOUNT_POINT '{}' is not a directory",
                self.data_mount_point.display()
            );
        }
        if let Some(key) = &self.ssh_key_path {
            if !key.is_file() {
                anyhow::bail!("SSH_KEY_PATH '{}' is not a readable file", key.display());
            }
        }
        if !matches!(self.external_secrets_provider.as_str(), "env" | "none") {
            anyhow::bail!(
                "EXTERNAL_SECRETS_PROVIDER must be 'env' or 'none', got '{}'",
                self.external_secrets_provider
            );
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("required environment variable {name} is not set"))
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_empty() {
        std::env::remove_var("DOCO_CD_TEST_UNSET");
        assert_eq!(env_or("DOCO_CD_TEST_UNSET", "fallback"), "fallback");
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        std::env::set_var("DOCO_CD_TEST_PORT", "not-a-port");
        let result: Result<u16> = parse_env("DOCO_CD_TEST_PORT", 80);
        assert!(result.is_err());
        std::env::remove_var("DOCO_CD_TEST_PORT");
    }

    #[test]
    fn test_parse_env_uses_default_when_unset() {
        std::env::remove_var("DOCO_CD_TEST_MISSING");
        let value: u16 = parse_env("DOCO_CD_TEST_MISSING", 42).unwrap();
        assert_eq!(value, 42);
    }

    fn valid_config(data_root: &std::path::Path) -> AppConfig {
        AppConfig {
            log_level: "info".to_string(),
            http_port: 8080,
            metrics_port: 9120,
            webhook_secret: "w".to_string(),
            api_secret: "a".to_string(),
            git_access_token: None,
            auth_type: "oauth2".to_string(),
            ssh_key_path: None,
            skip_tls_verification: false,
            data_mount_point: data_root.to_path_buf(),
            max_concurrent_deployments: 4,
            lock_timeout_secs: 180,
            max_payload_size: 1_048_576,
            max_deployment_loops: 3,
            deploy_config_dir: ".doco-cd".to_string(),
            notify_url: None,
            notify_level: crate::notify::NotifyLevel::Error,
            poll_config_file: None,
            external_secrets_provider: "env".to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(valid_config(tmp.path()).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_data_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = valid_config(tmp.path());
        config.data_mount_point = tmp.path().join("not-mounted");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ports() {
        let tmp = tempfile::tempdir().unwrap();

        let mut config = valid_config(tmp.path());
        config.http_port = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config(tmp.path());
        config.metrics_port = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config(tmp.path());
        config.metrics_port = config.http_port;
        assert!(config.validate().is_err());
    }
}
