use std::io::Write;

use manilink_client::settings::{
    ClientSettings, MAX_SETTINGS_BYTES, SettingsLoadError, SettingsSaveError,
    load_settings_from_path, load_settings_or_default, save_settings_with_retry,
};

#[test]
fn settings_roundtrip_save_load() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("nested").join("settings.json");

    let settings = ClientSettings {
        origin: "https://addon.example.com".to_owned(),
        request_timeout_ms: 2_500,
        ..ClientSettings::default()
    };

    save_settings_with_retry(&path, &settings).expect("save settings");
    let loaded = load_settings_from_path(&path).expect("load settings");
    assert_eq!(loaded, settings);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn invalid_settings_are_not_saved() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("settings.json");

    let settings = ClientSettings {
        origin: "not a url".to_owned(),
        ..ClientSettings::default()
    };
    let err = save_settings_with_retry(&path, &settings).expect_err("invalid origin");
    assert!(err.to_string().contains("Origin is invalid"), "unexpected error: {err}");
    assert!(!path.exists());
}

#[test]
fn load_settings_ignores_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("settings.json");

    let mut file = std::fs::File::create(&path).expect("create settings.json");
    file.write_all(&vec![b'a'; (MAX_SETTINGS_BYTES as usize) + 1024])
        .expect("write oversized settings.json");
    drop(file);

    let err = load_settings_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn load_settings_rejects_out_of_range_timeout() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("settings.json");
    std::fs::write(&path, r#"{"requestTimeoutMs": 0}"#).expect("write settings.json");

    let err = load_settings_from_path(&path).expect_err("zero timeout should error");
    assert!(matches!(err, SettingsLoadError::Invalid(_)));
}

#[test]
fn save_replaces_existing_settings() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("settings.json");

    let first = ClientSettings {
        origin: "https://first.example.com".to_owned(),
        ..ClientSettings::default()
    };
    let second = ClientSettings {
        origin: "https://second.example.com".to_owned(),
        ..ClientSettings::default()
    };
    save_settings_with_retry(&path, &first).expect("save first");
    save_settings_with_retry(&path, &second).expect("save second");

    assert_eq!(load_settings_from_path(&path).expect("load settings"), second);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn unusable_settings_directory_is_reported() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").expect("write blocker file");
    let path = blocker.join("settings.json");

    let err = save_settings_with_retry(&path, &ClientSettings::default())
        .expect_err("parent is a file");
    assert!(matches!(err, SettingsSaveError::CreateDir(_)), "unexpected error: {err}");
}

#[test]
fn missing_explicit_settings_file_uses_defaults() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("absent.json");

    let settings = load_settings_or_default(&path).expect("defaults");
    assert_eq!(settings, ClientSettings::default());
}
