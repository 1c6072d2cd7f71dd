//! Configuration management for the vigil service

use crate::error::{Result, VigilError};
use crate::listener::dns::DEFAULT_TTL;
use crate::listener::Limits;
use crate::recorder::RetryPolicy;
use crate::storage::Retention;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// File-based configuration structure matching vigil.toml
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    dns: Option<DnsSection>,
    smtp: Option<SmtpSection>,
    http: Option<HttpSection>,
    tls: Option<TlsSection>,
    api: Option<ApiSection>,
    limits: Option<LimitsSection>,
    storage: Option<StorageSection>,
    #[serde(default)]
    domains: Vec<DomainSeed>,
    #[serde(default)]
    users: Vec<UserSeed>,
}

#[derive(Debug, Deserialize)]
struct DnsSection {
    enabled: Option<bool>,
    interface: Option<IpAddr>,
    port: Option<u16>,
    tcp: Option<bool>,
    ttl: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SmtpSection {
    enabled: Option<bool>,
    interface: Option<IpAddr>,
    port: Option<u16>,
    submission_port: Option<u16>,
    ssl_port: Option<u16>,
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HttpSection {
    enabled: Option<bool>,
    interface: Option<IpAddr>,
    port: Option<u16>,
    tls_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct TlsSection {
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ApiSection {
    enabled: Option<bool>,
    interface: Option<IpAddr>,
    port: Option<u16>,
    api_host: Option<String>,
    session_minutes: Option<i64>,
    public_owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitsSection {
    idle_timeout_secs: Option<u64>,
    max_session_secs: Option<u64>,
    max_sessions_per_ip: Option<usize>,
    max_sessions: Option<usize>,
    max_line_bytes: Option<usize>,
    max_data_bytes: Option<usize>,
    max_http_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    backend: Option<String>,
    path: Option<PathBuf>,
    retry_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
    catalog_path: Option<PathBuf>,
    max_records_per_zone: Option<usize>,
    max_record_bytes: Option<usize>,
}

/// A domain registered at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainSeed {
    pub domain: String,
    #[serde(default)]
    pub public_ips: Vec<IpAddr>,
    pub owner: String,
    #[serde(default)]
    pub users: Vec<String>,
}

/// An account created at startup
#[derive(Debug, Clone, Deserialize)]
pub struct UserSeed {
    pub username: String,
    pub full_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Output of `vigil hash-password`
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub enabled: bool,
    pub interface: IpAddr,
    pub port: u16,
    /// Also serve DNS over TCP on the same port
    pub tcp: bool,
    pub ttl: u32,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub enabled: bool,
    pub interface: IpAddr,
    pub port: u16,
    pub submission_port: Option<u16>,
    /// Implicit TLS port, served only when TLS material loads
    pub ssl_port: Option<u16>,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub enabled: bool,
    pub interface: IpAddr,
    pub port: u16,
    pub tls_port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub enabled: bool,
    pub interface: IpAddr,
    pub port: u16,
    /// Public base URL the UI reaches the API at
    pub api_host: Option<Url>,
    pub session_minutes: i64,
    pub public_owner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Jsonl,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub path: PathBuf,
    pub retry: RetryPolicy,
    /// Domains, zones, grants and rules; next to `path` when unset
    pub catalog_path: Option<PathBuf>,
    pub retention: Retention,
}

impl StorageSettings {
    /// Where the ownership catalog is written for the jsonl backend
    pub fn catalog_file(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.path.with_extension("catalog.json"))
    }
}

/// Fully resolved service settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub dns: DnsSettings,
    pub smtp: SmtpSettings,
    pub http: HttpSettings,
    pub tls: TlsSettings,
    pub api: ApiSettings,
    pub limits: Limits,
    pub storage: StorageSettings,
    pub domains: Vec<DomainSeed>,
    pub users: Vec<UserSeed>,
}

const ANY: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

impl Default for Settings {
    fn default() -> Self {
        Self {
            dns: DnsSettings {
                enabled: true,
                interface: ANY,
                port: 53,
                tcp: true,
                ttl: DEFAULT_TTL,
            },
            smtp: SmtpSettings {
                enabled: true,
                interface: ANY,
                port: 25,
                submission_port: Some(587),
                ssl_port: Some(465),
                hostname: "vigil".to_string(),
            },
            http: HttpSettings {
                enabled: true,
                interface: ANY,
                port: 80,
                tls_port: Some(443),
            },
            tls: TlsSettings::default(),
            api: ApiSettings {
                enabled: true,
                interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 8080,
                api_host: None,
                session_minutes: 60,
                public_owner: crate::access::DEFAULT_PUBLIC_OWNER.to_string(),
            },
            limits: Limits::default(),
            storage: StorageSettings {
                backend: StorageBackend::Memory,
                path: PathBuf::from("vigil-requests.jsonl"),
                retry: RetryPolicy::default(),
                catalog_path: None,
                retention: Retention::default(),
            },
            domains: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// Port 0 in the file disables an optional listener
fn optional_port(port: u16) -> Option<u16> {
    (port != 0).then_some(port)
}

/// Loads configuration from a TOML file and merges with defaults
pub fn load_config(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(VigilError::IoError)?;
    parse_config(&content)
}

/// Parses TOML configuration text on top of the defaults
pub fn parse_config(content: &str) -> Result<Settings> {
    let file_config: FileConfig = toml::from_str(content)?;
    let mut settings = Settings::default();

    if let Some(dns) = file_config.dns {
        if let Some(enabled) = dns.enabled {
            settings.dns.enabled = enabled;
        }
        if let Some(interface) = dns.interface {
            settings.dns.interface = interface;
        }
        if let Some(port) = dns.port {
            settings.dns.port = port;
        }
        if let Some(tcp) = dns.tcp {
            settings.dns.tcp = tcp;
        }
        if let Some(ttl) = dns.ttl {
            settings.dns.ttl = ttl;
        }
    }

    if let Some(smtp) = file_config.smtp {
        if let Some(enabled) = smtp.enabled {
            settings.smtp.enabled = enabled;
        }
        if let Some(interface) = smtp.interface {
            settings.smtp.interface = interface;
        }
        if let Some(port) = smtp.port {
            settings.smtp.port = port;
        }
        if let Some(port) = smtp.submission_port {
            settings.smtp.submission_port = optional_port(port);
        }
        if let Some(port) = smtp.ssl_port {
            settings.smtp.ssl_port = optional_port(port);
        }
        if let Some(hostname) = smtp.hostname {
            settings.smtp.hostname = hostname;
        }
    }

    if let Some(http) = file_config.http {
        if let Some(enabled) = http.enabled {
            settings.http.enabled = enabled;
        }
        if let Some(interface) = http.interface {
            settings.http.interface = interface;
        }
        if let Some(port) = http.port {
            settings.http.port = port;
        }
        if let Some(port) = http.tls_port {
            settings.http.tls_port = optional_port(port);
        }
    }

    if let Some(tls) = file_config.tls {
        settings.tls.cert_file = tls.cert_file;
        settings.tls.key_file = tls.key_file;
    }

    if let Some(api) = file_config.api {
        if let Some(enabled) = api.enabled {
            settings.api.enabled = enabled;
        }
        if let Some(interface) = api.interface {
            settings.api.interface = interface;
        }
        if let Some(port) = api.port {
            settings.api.port = port;
        }
        if let Some(host) = api.api_host {
            settings.api.api_host = Some(parse_api_host(&host)?);
        }
        if let Some(minutes) = api.session_minutes {
            settings.api.session_minutes = minutes;
        }
        if let Some(owner) = api.public_owner {
            settings.api.public_owner = owner;
        }
    }

    if let Some(limits) = file_config.limits {
        let l = &mut settings.limits;
        if let Some(secs) = limits.idle_timeout_secs {
            l.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = limits.max_session_secs {
            l.max_session = Duration::from_secs(secs);
        }
        if let Some(n) = limits.max_sessions_per_ip {
            l.max_sessions_per_ip = n;
        }
        if let Some(n) = limits.max_sessions {
            l.max_sessions = n;
        }
        if let Some(n) = limits.max_line_bytes {
            l.max_line_bytes = n;
        }
        if let Some(n) = limits.max_data_bytes {
            l.max_data_bytes = n;
        }
        if let Some(n) = limits.max_http_body_bytes {
            l.max_http_body_bytes = n;
        }
    }

    if let Some(storage) = file_config.storage {
        if let Some(backend) = storage.backend {
            settings.storage.backend = parse_backend(&backend)?;
        }
        if let Some(path) = storage.path {
            settings.storage.path = path;
        }
        if let Some(attempts) = storage.retry_attempts {
            settings.storage.retry.attempts = attempts;
        }
        if let Some(ms) = storage.retry_base_ms {
            settings.storage.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(path) = storage.catalog_path {
            settings.storage.catalog_path = Some(path);
        }
        if let Some(n) = storage.max_records_per_zone {
            settings.storage.retention.max_per_zone = n;
        }
        if let Some(n) = storage.max_record_bytes {
            settings.storage.retention.max_bytes = n;
        }
    }

    settings.domains = file_config.domains;
    settings.users = file_config.users;

    validate(&settings)?;
    Ok(settings)
}

fn parse_backend(name: &str) -> Result<StorageBackend> {
    match name.to_ascii_lowercase().as_str() {
        "memory" => Ok(StorageBackend::Memory),
        "jsonl" | "file" => Ok(StorageBackend::Jsonl),
        other => Err(VigilError::ConfigError(format!(
            "unknown storage backend '{other}' (use memory or jsonl)"
        ))),
    }
}

/// Validates the public API base URL
pub fn parse_api_host(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| VigilError::ConfigError(format!("invalid api_host '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(VigilError::ConfigError(format!(
            "api_host must be an http(s) URL with a host, got '{raw}'"
        )));
    }
    Ok(url)
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.api.session_minutes <= 0 {
        return Err(VigilError::ConfigError(
            "api.session_minutes must be positive".to_string(),
        ));
    }
    if settings.limits.idle_timeout.is_zero() || settings.limits.max_session.is_zero() {
        return Err(VigilError::ConfigError(
            "limits timeouts must be positive".to_string(),
        ));
    }
    let retention = settings.storage.retention;
    if retention.max_per_zone == 0 || retention.max_bytes == 0 {
        return Err(VigilError::ConfigError(
            "storage retention bounds must be positive".to_string(),
        ));
    }
    if settings.tls.cert_file.is_some() != settings.tls.key_file.is_some() {
        return Err(VigilError::ConfigError(
            "tls.cert_file and tls.key_file must be set together".to_string(),
        ));
    }
    Ok(())
}

/// Command-line and environment overrides
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dns_port: Option<u16>,
    pub dns_interface: Option<IpAddr>,
    pub smtp_port: Option<u16>,
    pub smtp_submission_port: Option<u16>,
    pub smtp_ssl_port: Option<u16>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub api_port: Option<u16>,
    pub api_host: Option<String>,
    pub storage_path: Option<PathBuf>,
}

/// Merges CLI arguments into loaded settings
pub fn merge_cli_args(settings: &mut Settings, overrides: Overrides) -> Result<()> {
    if let Some(port) = overrides.dns_port {
        settings.dns.port = port;
    }
    if let Some(interface) = overrides.dns_interface {
        settings.dns.interface = interface;
    }
    if let Some(port) = overrides.smtp_port {
        settings.smtp.port = port;
    }
    if let Some(port) = overrides.smtp_submission_port {
        settings.smtp.submission_port = optional_port(port);
    }
    if let Some(port) = overrides.smtp_ssl_port {
        settings.smtp.ssl_port = optional_port(port);
    }
    if let Some(cert) = overrides.tls_cert_file {
        settings.tls.cert_file = Some(cert);
    }
    if let Some(key) = overrides.tls_key_file {
        settings.tls.key_file = Some(key);
    }
    if let Some(port) = overrides.api_port {
        settings.api.port = port;
    }
    if let Some(host) = overrides.api_host {
        settings.api.api_host = Some(parse_api_host(&host)?);
    }
    if let Some(path) = overrides.storage_path {
        settings.storage.path = path;
        settings.storage.backend = StorageBackend::Jsonl;
    }
    validate(settings)
}
