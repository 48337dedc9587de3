use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use sentinel_client::config::ClientConfig;
use sentinel_client::TransportMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTINEL_CONFIG",
        "SENTINEL_WS_URL",
        "SENTINEL_API_URL",
        "SENTINEL_TRANSPORT",
        "SENTINEL_TARGET_FPS",
        "SENTINEL_JPEG_QUALITY",
        "SENTINEL_DEVICE",
        "SENTINEL_RECONNECT_DELAY_MS",
        "SENTINEL_RECONNECT_MAX_ATTEMPTS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "service": {
            "ws_url": "wss://detector.example:8443/ws/camera",
            "api_url": "https://detector.example:8443",
            "transport": "request",
            "request_timeout_ms": 2500
        },
        "capture": {
            "device": "stub://yard",
            "target_fps": 5,
            "jpeg_quality": 0.8,
            "width": 1280,
            "height": 720,
            "frame_rate": 15
        },
        "reconnect": {
            "delay_ms": 2000,
            "max_attempts": 3
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("SENTINEL_CONFIG", file.path());
    std::env::set_var("SENTINEL_TARGET_FPS", "15");
    std::env::set_var("SENTINEL_DEVICE", "stub://gate");

    let cfg = ClientConfig::load().expect("load config");

    assert_eq!(cfg.ws_url, "wss://detector.example:8443/ws/camera");
    assert_eq!(cfg.api_url, "https://detector.example:8443");
    assert_eq!(cfg.transport, TransportMode::Request);
    assert_eq!(cfg.request_timeout, Duration::from_millis(2500));
    assert_eq!(cfg.capture.device, "stub://gate");
    assert_eq!(cfg.capture.target_fps, 15);
    assert!((cfg.capture.jpeg_quality - 0.8).abs() < f32::EPSILON);
    assert_eq!(cfg.capture.width, 1280);
    assert_eq!(cfg.capture.height, 720);
    assert_eq!(cfg.capture.frame_rate, 15);
    assert_eq!(cfg.reconnect.delay, Duration::from_secs(2));
    assert_eq!(cfg.reconnect.max_attempts, Some(3));
    assert_eq!(
        cfg.frame_endpoint(),
        "https://detector.example:8443/api/process_frame"
    );

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[service]
ws_url = "ws://10.0.0.5:5000/ws/camera"
transport = "stream"

[capture]
target_fps = 1
"#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("SENTINEL_CONFIG", file.path());

    let cfg = ClientConfig::load().expect("load config");
    assert_eq!(cfg.ws_url, "ws://10.0.0.5:5000/ws/camera");
    assert_eq!(cfg.transport, TransportMode::Stream);
    assert_eq!(cfg.capture.target_fps, 1);
    assert_eq!(cfg.api_url, "http://127.0.0.1:5000");

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = ClientConfig::load().expect("load config");
    assert_eq!(cfg, ClientConfig::default());
    assert_eq!(cfg.capture.target_fps, 10);
    assert_eq!(cfg.reconnect.delay, Duration::from_secs(5));
    assert_eq!(cfg.reconnect.max_attempts, None);
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    for (key, value) in [
        ("SENTINEL_TARGET_FPS", "0"),
        ("SENTINEL_TARGET_FPS", "fast"),
        ("SENTINEL_JPEG_QUALITY", "1.5"),
        ("SENTINEL_TRANSPORT", "carrier-pigeon"),
        ("SENTINEL_WS_URL", "http://127.0.0.1:5000/ws/camera"),
        ("SENTINEL_RECONNECT_DELAY_MS", "soon"),
    ] {
        clear_env();
        std::env::set_var(key, value);
        assert!(
            ClientConfig::load().is_err(),
            "{}={} should be rejected",
            key,
            value
        );
    }

    clear_env();
}

#[test]
fn rejects_unreadable_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ not json").expect("write config");
    std::env::set_var("SENTINEL_CONFIG", file.path());
    assert!(ClientConfig::load().is_err());

    std::env::set_var("SENTINEL_CONFIG", "/nonexistent/sentinel.json");
    assert!(ClientConfig::load().is_err());

    clear_env();
}
