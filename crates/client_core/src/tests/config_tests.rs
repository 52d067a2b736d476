use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

#[test]
fn defaults_match_documented_tunables() {
    let config = SyncConfig::default();
    assert_eq!(config.recency_window(), Duration::from_secs(1));
    assert_eq!(config.typing_debounce(), Duration::from_secs(1));
    assert!(config.typing_safety_expiry() > config.typing_debounce());
    assert_eq!(config.reconnect_policy().max_attempts, Some(10));
}

#[test]
fn partial_toml_keeps_remaining_defaults() {
    let config = parse_config("recency_window_ms = 2500\nmark_read_while_active = false\n");
    assert_eq!(config.recency_window_ms, 2_500);
    assert!(!config.mark_read_while_active);
    assert_eq!(config.history_page_size, 50);
}

#[test]
fn unparseable_toml_falls_back_to_defaults() {
    assert_eq!(parse_config("recency_window_ms = \"soon\""), SyncConfig::default());
}

#[test]
fn env_overrides_win_over_file_values() {
    let vars: HashMap<String, String> = [
        ("CHAT__RECENCY_WINDOW_MS", "750"),
        ("CHAT__RECONNECT_MAX_ATTEMPTS", "0"),
        ("CHAT__HISTORY_PAGE_SIZE", "5000"),
        ("CHAT__TYPING_DEBOUNCE_MS", "fast"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let mut config = parse_config("recency_window_ms = 2500");
    apply_env_overrides(&mut config, |key| vars.get(key).cloned());

    assert_eq!(config.recency_window_ms, 750);
    assert_eq!(config.reconnect_max_attempts, None);
    assert_eq!(config.history_page_size, 200);
    assert_eq!(config.typing_debounce_ms, 1_000);
}

#[test]
fn oversized_attempt_limit_is_ignored() {
    let mut config = parse_config("reconnect_max_attempts = 4");
    apply_env_overrides(&mut config, |key| {
        (key == "CHAT__RECONNECT_MAX_ATTEMPTS").then(|| "4294967296".to_string())
    });
    assert_eq!(config.reconnect_max_attempts, Some(4));

    apply_env_overrides(&mut config, |key| {
        (key == "CHAT__RECONNECT_MAX_ATTEMPTS").then(|| "4294967295".to_string())
    });
    assert_eq!(config.reconnect_max_attempts, Some(u32::MAX));
}

#[test]
fn load_config_reads_file_when_present() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("chat_client_config_{suffix}.toml"));
    fs::write(&path, "typing_safety_expiry_ms = 9000\n").expect("write config");

    let config = load_config(Some(&path));
    assert_eq!(config.typing_safety_expiry_ms, 9_000);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn reconnect_policy_never_has_max_below_initial() {
    let config = SyncConfig {
        reconnect_initial_delay_ms: 800,
        reconnect_max_delay_ms: 100,
        ..SyncConfig::default()
    };
    let policy = config.reconnect_policy();
    assert_eq!(policy.max_delay, Duration::from_millis(800));
}
