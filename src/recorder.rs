//! Request recorder: normalizes captured probes and persists them
//!
//! Storage trouble never reaches the prober. Writes are retried with a
//! short exponential backoff and then dropped with a warning.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, VigilError};
use crate::models::{MatchedRule, ParsedProbe, ProbeResponse, RequestRecord};
use crate::storage::RequestStore;

/// Retry settings for store writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Identifier handed back for a recorded request
pub type RequestId = Uuid;

/// Appends captured interactions to a request store
pub struct Recorder {
    store: Arc<dyn RequestStore>,
    retry: RetryPolicy,
    dropped: AtomicU64,
}

impl Recorder {
    pub fn new(store: Arc<dyn RequestStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Records dropped after exhausting retries
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Persists one interaction against `zone`
    pub async fn record(
        &self,
        zone: &str,
        probe: &ParsedProbe,
        response: &ProbeResponse,
        matched: Option<MatchedRule>,
    ) -> Result<RequestId> {
        let record = build_record(zone, probe, response, matched);
        let id = record.id;
        let attempts = self.retry.attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.store.append(record.clone()).await {
                Ok(()) => {
                    debug!("Recorded {} {} for zone {}", record.protocol, id, zone);
                    return Ok(id);
                }
                Err(VigilError::StorageUnavailable(reason)) if attempt < attempts => {
                    let delay = self.retry.base_delay * 2u32.saturating_pow(attempt - 1);
                    debug!(
                        "Store write attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, attempts, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropping {} request for zone {} from {}: {}",
                        record.protocol, zone, record.client_ip, e
                    );
                    return Err(e);
                }
            }
        }
    }
}

fn build_record(
    zone: &str,
    probe: &ParsedProbe,
    response: &ProbeResponse,
    matched: Option<MatchedRule>,
) -> RequestRecord {
    RequestRecord {
        id: Uuid::new_v4(),
        zone: zone.to_string(),
        fqdn: probe.hostname.clone(),
        time: probe.received_at,
        protocol: probe.payload.protocol(),
        client_ip: remote_ip(probe.remote),
        request: probe.payload.clone(),
        response: response.clone(),
        rule_matched: matched,
        reqsummary: probe.payload.summary(),
        respsummary: response.summary(),
    }
}

fn remote_ip(addr: SocketAddr) -> std::net::IpAddr {
    match addr.ip() {
        std::net::IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(std::net::IpAddr::V6(v6), std::net::IpAddr::V4),
        ip => ip,
    }
}
