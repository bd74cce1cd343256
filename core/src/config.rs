/// Configuration management
use crate::error::{InboxError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_SEND_ERROR_TTL: Duration = Duration::from_secs(5);

/// How the inbox is being presented. Mobile never auto-selects a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presentation {
    #[default]
    Desktop,
    Mobile,
}

/// Inbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend base URL, e.g. `https://crm.example.com/api`
    pub base_url: String,

    /// Background refresh cadence
    pub poll_interval: Duration,

    /// Upper bound for one network call; keeps the in-flight guard from starving ticks
    pub request_timeout: Duration,

    /// Desktop or mobile presentation
    pub presentation: Presentation,

    /// How long a send failure stays visible
    pub send_error_ttl: Duration,

    /// Local address for the view bridge (disabled when None)
    pub bridge_addr: Option<SocketAddr>,

    /// Optional JSON session file (tenant id + token)
    pub session_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_POLL_INTERVAL,
            presentation: Presentation::Desktop,
            send_error_ttl: DEFAULT_SEND_ERROR_TTL,
            bridge_addr: None,
            session_file: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut base_url: Option<String> = None;
        let mut poll_ms: Option<u64> = None;
        let mut timeout_ms: Option<u64> = None;
        let mut presentation = Presentation::Desktop;
        let mut bridge_port: Option<u16> = None;
        let mut session_file: Option<PathBuf> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--mobile" => {
                    presentation = Presentation::Mobile;
                    i += 1;
                }
                "--poll-ms" => {
                    poll_ms = Some(parse_flag_value(args, i, "--poll-ms")?);
                    i += 2;
                }
                "--timeout-ms" => {
                    timeout_ms = Some(parse_flag_value(args, i, "--timeout-ms")?);
                    i += 2;
                }
                "--bridge-port" => {
                    bridge_port = Some(parse_flag_value(args, i, "--bridge-port")?);
                    i += 2;
                }
                "--session" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        InboxError::Config("--session requires a path argument".to_string())
                    })?;
                    session_file = Some(PathBuf::from(path));
                    i += 2;
                }
                other if other.starts_with("--") => {
                    return Err(InboxError::Config(format!("Unknown flag: {}", other)));
                }
                other => {
                    base_url = Some(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("INBOX_BASE_URL") {
            if !url.trim().is_empty() {
                base_url = Some(url);
            }
        }
        if let Some(ms) = std::env::var("INBOX_POLL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            poll_ms = Some(ms);
        }
        if let Some(p) = std::env::var("INBOX_BRIDGE_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            bridge_port = Some(p);
        }

        let base_url = base_url.ok_or_else(|| {
            InboxError::Config(format!(
                "Usage: {} <base_url> [--mobile] [--poll-ms <ms>] [--timeout-ms <ms>] [--bridge-port <port>] [--session <path>]",
                args.first().map(String::as_str).unwrap_or("inbox")
            ))
        })?;

        let poll_interval = poll_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let request_timeout = timeout_ms.map(Duration::from_millis).unwrap_or(poll_interval);

        let bridge_addr = bridge_port
            .map(|p| format!("127.0.0.1:{}", p).parse())
            .transpose()
            .map_err(|_| InboxError::Config("Invalid bridge address".to_string()))?;

        let config = Self {
            base_url,
            poll_interval,
            request_timeout,
            presentation,
            bridge_addr,
            session_file,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the poll loop or the HTTP client
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(InboxError::Config(format!(
                "base URL must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(InboxError::Config("poll interval must be non-zero".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(InboxError::Config("request timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Base URL without a trailing slash
    pub fn api_root(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

fn parse_flag_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| InboxError::Config(format!("{} requires a value", flag)))?;
    raw.parse::<T>()
        .map_err(|_| InboxError::Config(format!("{} got an invalid value: {}", flag, raw)))
}
