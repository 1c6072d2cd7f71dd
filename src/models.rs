//! Core data models for Vigil

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::VigilError;

/// Permission a user holds on a zone or domain, lowest first
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    ReadOnly,
    ReadWrite,
    AssignRoles,
    Owner,
}

impl Permission {
    /// Numeric level as exposed to API clients
    pub fn level(&self) -> i32 {
        match self {
            Permission::ReadOnly => 0,
            Permission::ReadWrite => 10,
            Permission::AssignRoles => 20,
            Permission::Owner => 999,
        }
    }

    /// Maps a numeric level back to a permission
    pub fn from_level(level: i32) -> Option<Self> {
        match level {
            0 => Some(Permission::ReadOnly),
            10 => Some(Permission::ReadWrite),
            20 => Some(Permission::AssignRoles),
            999 => Some(Permission::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ReadOnly => write!(f, "READONLY"),
            Permission::ReadWrite => write!(f, "READWRITE"),
            Permission::AssignRoles => write!(f, "ASSIGNROLES"),
            Permission::Owner => write!(f, "OWNER"),
        }
    }
}

impl FromStr for Permission {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(level) = s.trim().parse::<i32>() {
            return Permission::from_level(level)
                .ok_or_else(|| VigilError::MalformedInput(format!("unknown permission level {level}")));
        }
        match s.trim().to_ascii_uppercase().as_str() {
            "READONLY" => Ok(Permission::ReadOnly),
            "READWRITE" => Ok(Permission::ReadWrite),
            "ASSIGNROLES" => Ok(Permission::AssignRoles),
            "OWNER" => Ok(Permission::Owner),
            other => Err(VigilError::MalformedInput(format!("unknown permission '{other}'"))),
        }
    }
}

/// Network protocol a probe arrived on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Dns,
    Smtp,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Dns => write!(f, "DNS"),
            Protocol::Smtp => write!(f, "SMTP"),
            Protocol::Http => write!(f, "HTTP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DNS" => Ok(Protocol::Dns),
            "SMTP" => Ok(Protocol::Smtp),
            "HTTP" | "HTTPS" => Ok(Protocol::Http),
            other => Err(VigilError::MalformedInput(format!("unknown protocol '{other}'"))),
        }
    }
}

/// A root DNS name under operator control
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub domain: String,
    pub public_ips: BTreeSet<IpAddr>,
    pub owner: String,
    /// Accounts allowed to issue zones under this domain
    #[serde(default)]
    pub users: Vec<String>,
}

/// A single-use subdomain issued to a tester
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Zone {
    pub fqdn: String,
    pub domain: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Zone {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A system account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
}

impl User {
    /// Admins bypass per-zone permission checks
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case("admin"))
    }
}

/// A parsed DNS question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub name: String,
    /// Record type mnemonic, e.g. "A" or "TYPE65"
    pub qtype: String,
    pub qtype_code: u16,
    pub qclass: u16,
    pub recursion_desired: bool,
}

/// DNS response codes the listener can emit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Rcode {
    NoError,
    ServFail,
    NxDomain,
    Refused,
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::ServFail => write!(f, "SERVFAIL"),
            Rcode::NxDomain => write!(f, "NXDOMAIN"),
            Rcode::Refused => write!(f, "REFUSED"),
        }
    }
}

impl FromStr for Rcode {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOERROR" => Ok(Rcode::NoError),
            "SERVFAIL" => Ok(Rcode::ServFail),
            "NXDOMAIN" => Ok(Rcode::NxDomain),
            "REFUSED" => Ok(Rcode::Refused),
            other => Err(VigilError::MalformedInput(format!("unknown rcode '{other}'"))),
        }
    }
}

/// Answer the DNS listener sends back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsResponse {
    pub rcode: Rcode,
    pub ttl: u32,
    /// Presentation-format answer data for the queried type
    pub answers: Vec<String>,
}

/// Envelope and content of one SMTP transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpRequest {
    pub helo: String,
    pub mail_from: String,
    pub rcpt_tos: Vec<String>,
    pub data: String,
}

/// Final reply line of an SMTP transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl Default for SmtpResponse {
    fn default() -> Self {
        Self {
            code: 250,
            message: "OK".to_string(),
        }
    }
}

/// A captured HTTP request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Option<String>,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub tls: bool,
}

impl HttpRequest {
    /// Looks up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response the HTTP listener sends back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

/// Protocol-specific payload of a probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Probe {
    Dns(DnsQuery),
    Smtp(SmtpRequest),
    Http(HttpRequest),
}

impl Probe {
    pub fn protocol(&self) -> Protocol {
        match self {
            Probe::Dns(_) => Protocol::Dns,
            Probe::Smtp(_) => Protocol::Smtp,
            Probe::Http(_) => Protocol::Http,
        }
    }

    /// One-line description for request listings
    pub fn summary(&self) -> String {
        match self {
            Probe::Dns(q) => format!("{} {}", q.qtype, q.name),
            Probe::Smtp(s) => format!(
                "SMTP FROM:{} TO:{}",
                s.mail_from,
                s.rcpt_tos.first().map(String::as_str).unwrap_or("none")
            ),
            Probe::Http(h) => match &h.query {
                Some(q) => format!("{} {}?{}", h.method, h.path, q),
                None => format!("{} {}", h.method, h.path),
            },
        }
    }
}

/// Protocol-specific response sent to the prober
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeResponse {
    Dns(DnsResponse),
    Smtp(SmtpResponse),
    Http(HttpResponse),
}

impl ProbeResponse {
    pub fn summary(&self) -> String {
        match self {
            ProbeResponse::Dns(r) if r.answers.is_empty() => r.rcode.to_string(),
            ProbeResponse::Dns(r) => format!("{} {}", r.rcode, r.answers.join(", ")),
            ProbeResponse::Smtp(r) => format!("{} {}", r.code, r.message),
            ProbeResponse::Http(r) => format!("{} ({} bytes)", r.status, r.body.len()),
        }
    }
}

/// A probe as parsed off the wire, before zone routing
#[derive(Debug, Clone)]
pub struct ParsedProbe {
    /// Hostname the probe targeted
    pub hostname: String,
    pub remote: SocketAddr,
    pub received_at: DateTime<Utc>,
    pub payload: Probe,
}

impl ParsedProbe {
    pub fn new(hostname: impl Into<String>, remote: SocketAddr, payload: Probe) -> Self {
        Self {
            hostname: hostname.into(),
            remote,
            received_at: Utc::now(),
            payload,
        }
    }
}

/// Reference to the rule that shaped a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchedRule {
    pub id: uuid::Uuid,
    pub name: String,
}

/// A persisted interaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: uuid::Uuid,
    pub zone: String,
    /// Exact hostname seen on the wire
    pub fqdn: String,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub time: DateTime<Utc>,
    pub protocol: Protocol,
    #[serde(rename = "clientip")]
    pub client_ip: IpAddr,
    pub request: Probe,
    pub response: ProbeResponse,
    #[serde(default)]
    pub rule_matched: Option<MatchedRule>,
    pub reqsummary: String,
    pub respsummary: String,
}
