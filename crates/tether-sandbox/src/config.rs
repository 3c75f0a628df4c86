use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tether_sync::{Backoff, SessionConfig};
use tether_types::Author;

pub struct SandboxConfig {
    pub author: Author,
    /// WebSocket endpoint; an in-process echo connection is used when unset.
    pub gateway_url: Option<String>,
    /// Local cache file; in-memory when unset.
    pub db_path: Option<PathBuf>,
    pub session: SessionConfig,
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => u64::from_str(raw.trim())
                    .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
                None => Ok(default),
            }
        };

        let mut session = SessionConfig::default();
        session.page_size = parse("TETHER_PAGE_SIZE", session.page_size as u64)? as usize;
        session.preview_count = parse("TETHER_PREVIEW_COUNT", session.preview_count as u64)? as usize;

        let transport = &mut session.transport;
        transport.text_ack_timeout = Duration::from_millis(parse(
            "TETHER_ACK_TIMEOUT_MS",
            transport.text_ack_timeout.as_millis() as u64,
        )?);
        transport.attachment_ack_timeout = Duration::from_millis(parse(
            "TETHER_ATTACHMENT_ACK_TIMEOUT_MS",
            transport.attachment_ack_timeout.as_millis() as u64,
        )?);

        let defaults = Backoff::default();
        session.backoff = Backoff {
            initial: Duration::from_millis(parse(
                "TETHER_BACKOFF_INITIAL_MS",
                defaults.initial.as_millis() as u64,
            )?),
            max_attempts: parse("TETHER_BACKOFF_MAX_ATTEMPTS", defaults.max_attempts.into())? as u32,
            ..defaults
        };

        if session.page_size == 0 {
            anyhow::bail!("TETHER_PAGE_SIZE must be positive");
        }

        let user_id = lookup("TETHER_USER_ID").unwrap_or_else(|| "sandbox".into());
        let display_name = lookup("TETHER_DISPLAY_NAME").unwrap_or_else(|| user_id.clone());

        Ok(Self {
            author: Author {
                id: user_id.into(),
                display_name,
            },
            gateway_url: lookup("TETHER_GATEWAY_URL").filter(|url| !url.is_empty()),
            db_path: lookup("TETHER_DB_PATH").filter(|p| !p.is_empty()).map(PathBuf::from),
            session,
        })
    }
}
