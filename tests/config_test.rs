//! Integration tests for configuration loading

use dispatch_engine::infra::{Config, StoreBackend};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "test-site"

[geocoder]
base_url = "http://geo.local"
languages = ["en"]
backoff_ms = 10

[routing]
base_url = "http://ors.local"
api_key = "secret"

[ranking]
shortlist_size = 3
route_timeout_ms = 500

[dispatch]
max_reservation_attempts = 5
lead_via_warehouse = false

[store]
backend = "redis"
key_prefix = "test"

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "test-site");
    assert_eq!(config.geocoder().languages, vec!["en".to_string()]);
    assert_eq!(config.geocoder().country_code, "md");
    assert_eq!(config.routing().resolved_api_key(), "secret");
    assert_eq!(config.routing().profile, "driving-car");
    assert_eq!(config.ranking().shortlist_size, 3);
    assert_eq!(config.ranking().max_concurrent_routes, 4);
    assert_eq!(config.dispatch().max_reservation_attempts, 5);
    assert!(!config.dispatch().lead_via_warehouse);
    assert_eq!(config.store().backend, StoreBackend::Redis);
    assert_eq!(config.store().op_timeout_ms, 2000);
    assert_eq!(config.fleet().file, "config/fleet.toml");
    assert_eq!(config.metrics().prometheus_port, 9091);
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.geocoder().languages, vec!["ro", "ru", "en"]);
    assert_eq!(config.geocoder().min_interval_ms, 1100);
    assert_eq!(config.ranking().shortlist_size, 5);
    assert_eq!(config.store().backend, StoreBackend::Memory);
}

#[test]
fn test_from_file_reports_parse_errors() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[store]\nbackend = \"postgres\"\n").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}

#[test]
fn test_shipped_configs_parse() {
    for file in ["config/dev.toml", "config/prod.toml"] {
        let path = format!("{}/{}", env!("CARGO_MANIFEST_DIR"), file);
        assert!(Config::from_file(&path).is_ok(), "{file}");
    }
}
