use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use ptz_headcount::config::HeadcountConfig;
use ptz_headcount::ErrorKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "HEADCOUNT_CONFIG",
        "HEADCOUNT_CAMERA_HOST",
        "HEADCOUNT_CONTROL_PORT",
        "HEADCOUNT_SNAPSHOT_URL",
        "HEADCOUNT_CAMERA_USER",
        "HEADCOUNT_CAMERA_PASS",
        "HEADCOUNT_WORKERS",
        "HEADCOUNT_OUTPUT_DIR",
        "HEADCOUNT_MODEL_PATH",
        "HEADCOUNT_DETECTOR",
    ] {
        std::env::remove_var(key);
    }
}

fn json_file(contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = json_file(
        r#"{
            "presets": [
                {"number": 1, "name": "Entrance"},
                {"number": 4},
                {"number": 2, "name": "Balcony"}
            ],
            "camera": {
                "host": "10.1.1.20",
                "control_port": 1259,
                "username": "operator",
                "password": "file-secret",
                "command_timeout_ms": 8000
            },
            "detector": {
                "confidence_threshold": 0.4,
                "overlap_threshold": 0.5
            },
            "clustering": {"radius": 35.5, "min_neighbors": 3},
            "capture": {"settle_ms": 2500, "recall_attempts": 4},
            "pipeline": {"workers": 2, "queue_depth": 8},
            "output_dir": "/var/lib/headcount"
        }"#,
    );
    std::env::set_var("HEADCOUNT_CONFIG", file.path());
    std::env::set_var("HEADCOUNT_CAMERA_PASS", "env-secret");
    std::env::set_var("HEADCOUNT_WORKERS", "6");

    let cfg = HeadcountConfig::load().expect("load config");

    let presets: Vec<(u16, &str)> = cfg
        .presets
        .iter()
        .map(|p| (p.number, p.name.as_str()))
        .collect();
    assert_eq!(
        presets,
        vec![(1, "Entrance"), (4, "Preset 4"), (2, "Balcony")]
    );
    assert_eq!(cfg.control.host, "10.1.1.20");
    assert_eq!(cfg.control.port, 1259);
    assert_eq!(cfg.control.command_timeout, Duration::from_millis(8000));
    assert_eq!(cfg.control.completion_timeout, Duration::from_secs(15));
    assert_eq!(cfg.snapshot.url, "http://10.1.1.20/snapshot.jpg");
    assert_eq!(cfg.snapshot.username.as_deref(), Some("operator"));
    assert_eq!(cfg.snapshot.password.as_deref(), Some("env-secret"));
    assert!((cfg.detector.confidence - 0.4).abs() < 1e-6);
    assert!((cfg.detector.overlap - 0.5).abs() < 1e-6);
    assert_eq!(cfg.clustering.radius, 35.5);
    assert_eq!(cfg.clustering.min_neighbors, 3);
    assert_eq!(cfg.capture.settle, Duration::from_millis(2500));
    assert_eq!(cfg.capture.recall_attempts, 4);
    assert_eq!(cfg.workers, 6);
    assert_eq!(cfg.queue_depth, 8);
    assert_eq!(cfg.output_dir, PathBuf::from("/var/lib/headcount"));

    clear_env();
}

#[test]
fn loads_toml_config_with_separate_preset_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("presets.json"),
        r#"{"presets": [{"number": 7, "name": "Choir"}, {"number": 8, "name": "Nave"}]}"#,
    )
    .expect("write presets");
    let config_path = dir.path().join("headcount.toml");
    std::fs::write(
        &config_path,
        r#"
preset_file = "presets.json"

[camera]
host = "camera.local"

[snapshot]
url = "https://camera.local/cgi-bin/still.jpg"
attempts = 5
"#,
    )
    .expect("write toml");
    std::env::set_var("HEADCOUNT_CAMERA_HOST", "192.168.5.5");
    std::env::set_var("HEADCOUNT_DETECTOR", "stub");

    let cfg = HeadcountConfig::load_from(Some(&config_path)).expect("load config");

    assert_eq!(cfg.presets.len(), 2);
    assert_eq!(cfg.presets[0].name, "Choir");
    assert_eq!(cfg.control.host, "192.168.5.5");
    assert_eq!(cfg.control.port, 5678);
    // An explicit snapshot url is not rewritten by the host override.
    assert_eq!(cfg.snapshot.url, "https://camera.local/cgi-bin/still.jpg");
    assert_eq!(cfg.snapshot.attempts, 5);
    assert_eq!(cfg.detector.backend, "stub");

    clear_env();
}

#[test]
fn host_override_moves_default_snapshot_url() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = json_file(r#"{"presets": [{"number": 1, "name": "Entrance"}]}"#);
    std::env::set_var("HEADCOUNT_CAMERA_HOST", "172.16.0.9");

    let cfg = HeadcountConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.snapshot.url, "http://172.16.0.9/snapshot.jpg");

    clear_env();
}

#[test]
fn rejects_invalid_configurations() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        r#"{"presets": [{"number": 1}, {"number": 1}]}"#,
        r#"{"presets": [{"number": 0}]}"#,
        r#"{"presets": [{"number": 300}]}"#,
        r#"{"presets": []}"#,
        r#"{"presets": [{"number": 1}], "detector": {"confidence_threshold": 2.0}}"#,
        r#"{"presets": [{"number": 1}], "clustering": {"radius": -5}}"#,
        r#"{"presets": [{"number": 1}], "clustering": {"min_neighbors": 0}}"#,
        r#"{"presets": [{"number": 1}], "pipeline": {"workers": 0}}"#,
        r#"{"presets": [{"number": 1}], "preset_file": "other.json"}"#,
        r#"{"presets": [{"number": 1}], "snapshot": {"url": "ftp://camera/still.jpg"}}"#,
        r#"{"presets": "#,
    ];
    for case in cases {
        let file = json_file(case);
        let err = HeadcountConfig::load_from(Some(file.path())).expect_err(case);
        assert_eq!(err.kind, ErrorKind::ConfigInvalid, "{}", case);
    }

    let file = json_file(r#"{"presets": [{"number": 1}]}"#);
    std::env::set_var("HEADCOUNT_WORKERS", "many");
    let err = HeadcountConfig::load_from(Some(file.path())).expect_err("bad workers");
    assert_eq!(err.kind, ErrorKind::ConfigInvalid);
    assert!(err.message.contains("HEADCOUNT_WORKERS"));

    clear_env();
}

#[test]
fn missing_config_file_is_config_invalid() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = HeadcountConfig::load_from(Some(std::path::Path::new(
        "/nonexistent/headcount.json",
    )))
    .expect_err("missing file");
    assert_eq!(err.kind, ErrorKind::ConfigInvalid);
}
