use sluice::config::{Backend, Config, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use std::sync::Mutex;
use std::time::Duration;

// LISTEN and SLUICE_CONFIG are process-wide
static ENV: Mutex<()> = Mutex::new(());

#[test]
fn test_config_default_address() {
    let _env = ENV.lock().unwrap();
    // When LISTEN env var is not set, should use default
    unsafe {
        std::env::remove_var("LISTEN");
        std::env::remove_var("SLUICE_CONFIG");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
}

#[test]
fn test_config_custom_address_from_env() {
    let _env = ENV.lock().unwrap();
    unsafe {
        std::env::remove_var("SLUICE_CONFIG");
        std::env::set_var("LISTEN", "0.0.0.0:3000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:3000");
    unsafe {
        std::env::remove_var("LISTEN");
    }
}

#[test]
fn test_config_file_then_env_override() {
    let _env = ENV.lock().unwrap();
    let path = std::env::temp_dir().join(format!("sluice-config-{}.yaml", std::process::id()));
    std::fs::write(
        &path,
        "server:\n  listen_addr: 127.0.0.1:9000\nstream:\n  backend: channel\n",
    )
    .unwrap();

    unsafe {
        std::env::set_var("SLUICE_CONFIG", &path);
        std::env::remove_var("LISTEN");
    }
    let from_file = Config::load().unwrap();
    assert_eq!(from_file.server.listen_addr, "127.0.0.1:9000");
    assert_eq!(from_file.stream.backend, Backend::Channel);

    unsafe {
        std::env::set_var("LISTEN", "0.0.0.0:5000");
    }
    let overridden = Config::load().unwrap();
    assert_eq!(overridden.server.listen_addr, "0.0.0.0:5000");
    assert_eq!(overridden.stream.backend, Backend::Channel);

    unsafe {
        std::env::remove_var("LISTEN");
        std::env::remove_var("SLUICE_CONFIG");
    }
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_config_missing_file_is_an_error() {
    let err = Config::from_file("/nonexistent/sluice.yaml").unwrap_err();
    assert!(err.to_string().contains("failed to read"));
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::default();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.server.listen_addr, cfg2.server.listen_addr);
    assert_eq!(cfg1.stream.amount_to_buffer, cfg2.stream.amount_to_buffer);
}

#[test]
fn test_stream_defaults() {
    let cfg = Config::default();
    let stream = &cfg.stream;
    assert_eq!(stream.backend, Backend::Pipeline);
    assert_eq!(stream.read_timeout(), None);
    assert_eq!(stream.write_timeout(), Some(Duration::from_secs(30)));
    assert_eq!(stream.threshold(), 32 * 1024);
    assert_eq!(stream.chunk_size(), 16 * 1024);
    assert!(!stream.run_inline);
    assert_eq!(stream.probe_wait(), Duration::from_millis(10));
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let cfg = Config::from_yaml_str(
        "stream:\n  amount_to_buffer: 16\n  read_timeout_ms: 250\n  run_inline: true\n",
    )
    .unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.stream.threshold(), 16);
    assert_eq!(cfg.stream.chunk_size(), 8);
    assert_eq!(cfg.stream.read_timeout(), Some(Duration::from_millis(250)));
    assert!(cfg.stream.run_inline);
    assert_eq!(cfg.stream.write_timeout_ms, 30_000);
}

#[test]
fn test_zero_write_timeout_disables_it() {
    let cfg = Config::from_yaml_str("stream:\n  write_timeout_ms: 0\n").unwrap();
    assert_eq!(cfg.stream.write_timeout(), None);
}

#[test]
fn test_chunk_size_clamping() {
    let mut cfg = Config::default();

    cfg.stream.amount_to_buffer = 4;
    assert_eq!(cfg.stream.chunk_size(), 4);

    cfg.stream.amount_to_buffer = 0;
    assert_eq!(cfg.stream.threshold(), 1);
    assert_eq!(cfg.stream.chunk_size(), 1);

    cfg.stream.amount_to_buffer = 1024 * 1024;
    assert_eq!(cfg.stream.chunk_size(), MAX_CHUNK_SIZE);

    cfg.stream.amount_to_buffer = 100;
    cfg.stream.chunk_size = Some(1000);
    assert_eq!(cfg.stream.chunk_size(), 100);

    cfg.stream.chunk_size = Some(MIN_CHUNK_SIZE / 2);
    assert_eq!(cfg.stream.chunk_size(), MIN_CHUNK_SIZE / 2);
}

#[test]
fn test_unknown_backend_rejected() {
    assert!(Config::from_yaml_str("stream:\n  backend: carrier-pigeon\n").is_err());
}
