//! Tests for configuration loading and CLI overrides

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use vigil::config::{self, Overrides, Settings, StorageBackend};
use vigil::error::VigilError;

const SAMPLE: &str = r#"
[dns]
port = 5353
tcp = false
ttl = 30

[smtp]
port = 2525
submission_port = 0
hostname = "mx.ssrf.uk"

[http]
port = 8081
tls_port = 0

[api]
port = 9090
api_host = "https://api.ssrf.uk"
session_minutes = 15

[limits]
idle_timeout_secs = 5
max_sessions_per_ip = 4

[storage]
backend = "jsonl"
path = "/var/lib/vigil/requests.jsonl"
retry_attempts = 5
max_records_per_zone = 500

[[domains]]
domain = "ssrf.uk"
public_ips = ["203.0.113.7", "2001:db8::7"]
owner = "dusseldorf"

[[users]]
username = "alice"
roles = ["admin"]
password_hash = "$2b$04$abcdefghijklmnopqrstuu5Ls4zV1lFzz4DkwSk0X4pJrGqSmkFDa"
"#;

#[test]
fn test_defaults() {
    let settings = Settings::default();
    assert_eq!(settings.dns.port, 53);
    assert!(settings.dns.tcp);
    assert_eq!(settings.smtp.port, 25);
    assert_eq!(settings.smtp.submission_port, Some(587));
    assert_eq!(settings.smtp.ssl_port, Some(465));
    assert_eq!(settings.http.tls_port, Some(443));
    assert_eq!(settings.api.port, 8080);
    assert_eq!(settings.storage.backend, StorageBackend::Memory);
    assert!(settings.domains.is_empty());
}

#[test]
fn test_parse_full_file() {
    let settings = config::parse_config(SAMPLE).unwrap();
    assert_eq!(settings.dns.port, 5353);
    assert!(!settings.dns.tcp);
    assert_eq!(settings.dns.ttl, 30);
    assert_eq!(settings.smtp.port, 2525);
    assert_eq!(settings.smtp.submission_port, None);
    assert_eq!(settings.smtp.ssl_port, Some(465));
    assert_eq!(settings.smtp.hostname, "mx.ssrf.uk");
    assert_eq!(settings.http.tls_port, None);
    assert_eq!(settings.api.port, 9090);
    assert_eq!(
        settings.api.api_host.as_ref().map(|u| u.host_str()),
        Some(Some("api.ssrf.uk"))
    );
    assert_eq!(settings.api.session_minutes, 15);
    assert_eq!(settings.limits.idle_timeout, Duration::from_secs(5));
    assert_eq!(settings.limits.max_sessions_per_ip, 4);
    assert_eq!(settings.storage.backend, StorageBackend::Jsonl);
    assert_eq!(settings.storage.retry.attempts, 5);
    assert_eq!(settings.storage.retention.max_per_zone, 500);
    assert_eq!(
        settings.storage.catalog_file(),
        PathBuf::from("/var/lib/vigil/requests.catalog.json")
    );
    assert_eq!(settings.domains.len(), 1);
    assert_eq!(settings.domains[0].public_ips.len(), 2);
    assert_eq!(settings.users[0].roles, vec!["admin".to_string()]);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[dns]\nport = 10053\n").unwrap();
    let settings = config::load_config(file.path()).unwrap();
    assert_eq!(settings.dns.port, 10053);
    assert_eq!(settings.smtp.port, 25);

    assert!(matches!(
        config::load_config(&PathBuf::from("/nonexistent/vigil.toml")),
        Err(VigilError::IoError(_))
    ));
}

#[test]
fn test_invalid_files_rejected() {
    assert!(matches!(
        config::parse_config("[dns]\nport = \"fifty-three\"\n"),
        Err(VigilError::TomlError(_))
    ));
    assert!(matches!(
        config::parse_config("[api]\napi_host = \"ftp://files\"\n"),
        Err(VigilError::ConfigError(_))
    ));
    assert!(matches!(
        config::parse_config("[tls]\ncert_file = \"cert.pem\"\n"),
        Err(VigilError::ConfigError(_))
    ));
    assert!(matches!(
        config::parse_config("[storage]\nbackend = \"postgres\"\n"),
        Err(VigilError::ConfigError(_))
    ));
    assert!(matches!(
        config::parse_config("[storage]\nmax_records_per_zone = 0\n"),
        Err(VigilError::ConfigError(_))
    ));
    assert!(matches!(
        config::parse_config("[limits]\nidle_timeout_secs = 0\n"),
        Err(VigilError::ConfigError(_))
    ));
}

#[test]
fn test_cli_overrides_win() {
    let mut settings = config::parse_config(SAMPLE).unwrap();
    config::merge_cli_args(
        &mut settings,
        Overrides {
            dns_port: Some(53),
            dns_interface: Some("127.0.0.1".parse().unwrap()),
            smtp_submission_port: Some(1587),
            smtp_ssl_port: Some(0),
            api_host: Some("http://localhost:9090".to_string()),
            storage_path: Some(PathBuf::from("/tmp/requests.jsonl")),
            ..Overrides::default()
        },
    )
    .unwrap();

    assert_eq!(settings.dns.port, 53);
    assert_eq!(settings.dns.interface.to_string(), "127.0.0.1");
    assert_eq!(settings.smtp.submission_port, Some(1587));
    assert_eq!(settings.smtp.ssl_port, None);
    assert_eq!(settings.smtp.port, 2525);
    assert_eq!(settings.storage.path, PathBuf::from("/tmp/requests.jsonl"));
    assert_eq!(settings.storage.backend, StorageBackend::Jsonl);
}

#[test]
fn test_override_tls_pair_validated() {
    let mut settings = Settings::default();
    let result = config::merge_cli_args(
        &mut settings,
        Overrides {
            tls_cert_file: Some(PathBuf::from("cert.pem")),
            ..Overrides::default()
        },
    );
    assert!(matches!(result, Err(VigilError::ConfigError(_))));

    let mut settings = Settings::default();
    assert!(config::merge_cli_args(
        &mut settings,
        Overrides {
            api_host: Some("not a url".to_string()),
            ..Overrides::default()
        },
    )
    .is_err());
}

#[test]
fn test_shipped_config_parses() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/vigil.toml");
    let settings = config::load_config(&path).unwrap();
    assert!(!settings.domains.is_empty());
}
