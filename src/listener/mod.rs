//! Protocol listeners for captured interactions
//!
//! Every listener follows the same pipeline: parse the raw exchange into a
//! [`ParsedProbe`], route its hostname to a zone, let the zone's rules shape
//! the default response, reply, and only then hand the interaction to the
//! recorder. Unowned hostnames get a generic negative answer and are never
//! recorded.

pub mod dns;
pub mod http;
pub mod limits;
pub mod smtp;
pub mod tls;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::{MatchedRule, ParsedProbe, Probe, ProbeResponse, Protocol};
use crate::recorder::{Recorder, RequestId};
use crate::registry::{ZoneMatch, ZoneRegistry};
use crate::rules::RuleEngine;

pub use limits::{Limits, SessionLimiter, SessionPermit};

/// A bound socket serving one protocol until it fails
#[async_trait]
pub trait Listener: Send + Sync {
    /// Human-readable label, e.g. "dns/udp 0.0.0.0:53"
    fn name(&self) -> String;

    /// Protocol whose probes this listener captures
    fn protocol(&self) -> Protocol;

    /// Serves connections; returns only on a fatal socket error
    async fn run(&self) -> Result<()>;
}

/// A routed probe waiting to be recorded once the reply is out
#[derive(Debug, Clone)]
pub struct Capture {
    pub zone: ZoneMatch,
    pub probe: ParsedProbe,
    pub response: ProbeResponse,
    pub matched: Option<MatchedRule>,
}

/// State shared by every listener
pub struct CaptureContext {
    pub registry: Arc<ZoneRegistry>,
    pub rules: Arc<RuleEngine>,
    pub recorder: Arc<Recorder>,
    pub limits: Limits,
    pub limiter: SessionLimiter,
}

impl CaptureContext {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        rules: Arc<RuleEngine>,
        recorder: Arc<Recorder>,
        limits: Limits,
    ) -> Self {
        let limiter = SessionLimiter::new(limits.max_sessions_per_ip, limits.max_sessions);
        Self {
            registry,
            rules,
            recorder,
            limits,
            limiter,
        }
    }

    /// Routes a hostname to its live zone
    pub fn resolve(&self, hostname: &str) -> Option<ZoneMatch> {
        self.registry.resolve(hostname)
    }

    /// Shapes a protocol default response with the zone's first matching rule
    pub fn respond(
        &self,
        zone: &ZoneMatch,
        probe: &Probe,
        default: ProbeResponse,
    ) -> (ProbeResponse, Option<MatchedRule>) {
        let evaluation = self.rules.evaluate(&zone.zone.fqdn, probe);
        let mut response = default;
        evaluation.apply(&mut response);
        (response, evaluation.matched)
    }

    /// Hands a capture to the recorder; failures are logged, never surfaced
    pub async fn record(&self, capture: Capture) -> Option<RequestId> {
        let Capture {
            zone,
            probe,
            response,
            matched,
        } = capture;
        match self
            .recorder
            .record(&zone.zone.fqdn, &probe, &response, matched)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Interaction on {} not recorded: {}", zone.zone.fqdn, e);
                None
            }
        }
    }
}

/// Collection of listeners started together
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn Listener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener
    pub fn register(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    /// Spawns every listener as a background task
    pub fn spawn_all(&self) -> Vec<JoinHandle<()>> {
        self.listeners
            .iter()
            .map(|listener| {
                let listener = Arc::clone(listener);
                info!("Starting {} listener {}", listener.protocol(), listener.name());
                tokio::spawn(async move {
                    if let Err(e) = listener.run().await {
                        error!("Listener {} stopped: {}", listener.name(), e);
                    }
                })
            })
            .collect()
    }
}
