//! # Notifications
//!
//! Level-gated, best-effort deployment notifications. Sends are spawned on a
//! separate task with a hard deadline so a slow or dead endpoint can never
//! block the pipeline; failures are logged and never propagated.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::constants;

/// Severity of a notification. Ordered so a configured minimum level can
/// gate sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for NotifyLevel {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(anyhow::anyhow!("unknown notification level '{other}'")),
        }
    }
}

#[derive(Debug, Serialize)]
struct NotifyBody {
    title: String,
    message: String,
    level: NotifyLevel,
}

/// Fire-and-forget notification client.
#[derive(Debug, Clone)]
pub struct Notifier {
    url: Option<String>,
    min_level: NotifyLevel,
    client: reqwest::Client,
}

impl Notifier {
    /// `url = None` disables sending entirely (every call becomes a no-op).
    pub fn new(url: Option<String>, min_level: NotifyLevel) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(constants::NOTIFICATION_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            url,
            min_level,
            client,
        }
    }

    /// Send a notification without blocking the caller.
    ///
    /// Metadata entries are appended to the message as `key: value` lines.
    /// Dropped silently when no URL is configured or `level` is below the
    /// configured minimum.
    pub fn send(&self, level: NotifyLevel, title: &str, message: &str, metadata: &[(&str, &str)]) {
        let Some(url) = self.url.clone() else {
            return;
        };
        if level < self.min_level {
            debug!(%level, title, "notification below configured level, dropped");
            return;
        }

        let mut full_message = message.to_string();
        for (key, value) in metadata {
            full_message.push('\n');
            full_message.push_str(key);
            full_message.push_str(": ");
            full_message.push_str(value);
        }

        let body = NotifyBody {
            title: title.to_string(),
            message: full_message,
            level,
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(
                        status = %response.status(),
                        title = body.title,
                        "notification endpoint rejected send"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, title = body.title, "notification send failed");
                }
            }
        });
    }
}
