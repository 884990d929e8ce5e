use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_settings_path(tag: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("dashboard_settings_{tag}_{suffix}.toml"))
}

#[test]
fn normalizes_trailing_slash_and_whitespace() {
    assert_eq!(
        normalize_server_url("  https://iot.example.com/ "),
        "https://iot.example.com"
    );
    assert_eq!(normalize_server_url(""), "http://127.0.0.1:3000");
}

#[test]
fn missing_file_yields_defaults() {
    let settings = load_settings_from(&temp_settings_path("missing"));
    assert_eq!(settings.poll_interval_ms, 250);
    assert_eq!(settings.poll_interval(), Duration::from_millis(250));
}

#[test]
fn file_values_override_defaults() {
    let path = temp_settings_path("file");
    fs::write(
        &path,
        "server_url = \"http://10.0.0.5:8080/\"\npoll_interval_ms = 500\n",
    )
    .expect("write settings");

    let mut settings = ClientSettings::default();
    let raw = fs::read_to_string(&path).expect("read settings");
    apply_file_settings(&mut settings, toml::from_str(&raw).expect("parse"));
    assert_eq!(settings.server_url, "http://10.0.0.5:8080/");
    assert_eq!(settings.poll_interval_ms, 500);
    assert_eq!(settings.event_capacity, 1024);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn env_overrides_take_precedence_and_ignore_garbage() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("DASHBOARD_SERVER_URL", "http://legacy:1"),
        ("APP__SERVER_URL", "http://preferred:2"),
        ("APP__POLL_INTERVAL_MS", "not-a-number"),
        ("APP__EVENT_CAPACITY", "0"),
    ]);
    let mut settings = ClientSettings::default();
    apply_env_overrides(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_url, "http://preferred:2");
    assert_eq!(settings.poll_interval_ms, 250);
    assert_eq!(settings.event_capacity, 1024);
}
