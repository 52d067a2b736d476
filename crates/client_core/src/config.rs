use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::channel::ReconnectPolicy;

const ENV_PREFIX: &str = "CHAT__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tolerance used to match an optimistic send with its server echo.
    pub recency_window_ms: u64,
    pub typing_debounce_ms: u64,
    pub typing_safety_expiry_ms: u64,
    pub typing_sweep_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub history_page_size: u32,
    pub mark_read_while_active: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            recency_window_ms: 1_000,
            typing_debounce_ms: 1_000,
            typing_safety_expiry_ms: 5_000,
            typing_sweep_interval_ms: 500,
            reconnect_initial_delay_ms: 250,
            reconnect_max_delay_ms: 5_000,
            reconnect_max_attempts: Some(10),
            history_page_size: 50,
            mark_read_while_active: true,
        }
    }
}

impl SyncConfig {
    pub fn recency_window(&self) -> Duration {
        Duration::from_millis(self.recency_window_ms)
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn typing_safety_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_safety_expiry_ms)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(
                self.reconnect_max_delay_ms.max(self.reconnect_initial_delay_ms),
            ),
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

/// Defaults, then `path` (TOML) when it exists, then `CHAT__*` variables.
pub fn load_config(path: Option<&Path>) -> SyncConfig {
    let mut config = path
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|raw| parse_config(&raw))
        .unwrap_or_default();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

fn parse_config(raw: &str) -> SyncConfig {
    match toml::from_str::<SyncConfig>(raw) {
        Ok(config) => config,
        Err(err) => {
            warn!("config: ignoring unparseable client config: {err}");
            SyncConfig::default()
        }
    }
}

fn apply_env_overrides(config: &mut SyncConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read_u64 = |name: &str| -> Option<u64> {
        let key = format!("{ENV_PREFIX}{name}");
        let raw = lookup(&key)?;
        match raw.trim().parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("config: {key}={raw} is not a number; keeping previous value");
                None
            }
        }
    };

    if let Some(v) = read_u64("RECENCY_WINDOW_MS") {
        config.recency_window_ms = v;
    }
    if let Some(v) = read_u64("TYPING_DEBOUNCE_MS") {
        config.typing_debounce_ms = v;
    }
    if let Some(v) = read_u64("TYPING_SAFETY_EXPIRY_MS") {
        config.typing_safety_expiry_ms = v;
    }
    if let Some(v) = read_u64("TYPING_SWEEP_INTERVAL_MS") {
        config.typing_sweep_interval_ms = v;
    }
    if let Some(v) = read_u64("RECONNECT_INITIAL_DELAY_MS") {
        config.reconnect_initial_delay_ms = v;
    }
    if let Some(v) = read_u64("RECONNECT_MAX_DELAY_MS") {
        config.reconnect_max_delay_ms = v;
    }
    if let Some(v) = read_u64("RECONNECT_MAX_ATTEMPTS") {
        match u32::try_from(v) {
            Ok(0) => config.reconnect_max_attempts = None,
            Ok(attempts) => config.reconnect_max_attempts = Some(attempts),
            Err(_) => warn!("config: RECONNECT_MAX_ATTEMPTS={v} does not fit in u32; ignored"),
        }
    }
    if let Some(v) = read_u64("HISTORY_PAGE_SIZE") {
        config.history_page_size = v.clamp(1, 200) as u32;
    }
    if let Some(raw) = lookup(&format!("{ENV_PREFIX}MARK_READ_WHILE_ACTIVE")) {
        config.mark_read_while_active = matches!(raw.trim(), "1" | "true" | "yes");
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
