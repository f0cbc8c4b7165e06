use parley::ParleyApp;
use parley_core::config::{BackendKind, ClientSettings};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

#[test]
fn mock_config_file_drives_the_app() {
    let runtime = test_runtime();
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("parley.yaml");
    fs::write(
        &path,
        "backend:\n  kind: mock\nsession:\n  user_id: 6f1c2a8e-3d4b-4c5a-9e7f-0a1b2c3d4e5f\nchat_list:\n  poll_interval_ms: 1000\n",
    )
    .expect("write config");

    let settings = ClientSettings::load_from(&path).expect("settings");
    assert_eq!(settings.backend, BackendKind::Mock);
    assert_eq!(settings.poll_interval, Duration::from_millis(1_000));

    let app = ParleyApp::from_settings(settings).expect("app");
    let id = runtime.block_on(app.new_chat("From file")).expect("chat");
    let chats = runtime.block_on(app.list_chats()).expect("list");
    assert_eq!(chats[0].id, id);
    assert_eq!(chats[0].title, "From file");
}

#[test]
fn missing_explicit_file_is_an_error() {
    let temp_dir = TempDir::new().expect("temp dir");
    let err = ClientSettings::load_from(&temp_dir.path().join("absent.yaml")).unwrap_err();
    assert!(err.user_message().contains("does not exist"));
}

#[test]
fn malformed_yaml_is_reported() {
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("parley.yaml");
    fs::write(&path, "backend: [unclosed").expect("write config");
    let err = ClientSettings::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("invalid parley.yaml"));
}
