//! Operator CLI behaviour that needs no providers

use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

#[test]
fn test_release_on_memory_backend_fails() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "[store]\nbackend = \"memory\"").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_dispatch-engine"))
        .arg("--config")
        .arg(config.path())
        .args(["release", "t1"])
        .env("RUST_LOG", "warn")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("memory backend"), "stderr: {stderr}");
}
