//! Common test utilities
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use vigil::access::AccessControl;
use vigil::identity::{hash_password_with_cost, Identity};
use vigil::listener::{CaptureContext, Limits};
use vigil::models::{User, Zone};
use vigil::recorder::{Recorder, RetryPolicy};
use vigil::registry::ZoneRegistry;
use vigil::rules::{RuleComponent, RuleEngine};
use vigil::storage::{MemoryRequestStore, RequestStore};

pub const DOMAIN: &str = "ssrf.uk";
pub const PUBLIC_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

/// Registry, rules and an in-memory store wired into a capture context
pub struct Fixture {
    pub registry: Arc<ZoneRegistry>,
    pub rules: Arc<RuleEngine>,
    pub store: Arc<MemoryRequestStore>,
    pub ctx: Arc<CaptureContext>,
}

impl Fixture {
    pub fn new() -> Self {
        let registry = Arc::new(ZoneRegistry::new());
        let rules = Arc::new(RuleEngine::new());
        let store = Arc::new(MemoryRequestStore::new());
        let dyn_store: Arc<dyn RequestStore> = store.clone();
        let recorder = Arc::new(Recorder::new(dyn_store, RetryPolicy::default()));
        let limits = Limits {
            idle_timeout: Duration::from_secs(2),
            ..Limits::default()
        };
        let ctx = Arc::new(CaptureContext::new(
            Arc::clone(&registry),
            Arc::clone(&rules),
            recorder,
            limits,
        ));
        registry
            .register_domain(DOMAIN, public_ips(), "dusseldorf")
            .expect("register domain");
        Self {
            registry,
            rules,
            store,
            ctx,
        }
    }

    /// Issues a zone with a fixed label
    pub fn zone(&self, label: &str) -> Zone {
        self.registry
            .issue_zone(DOMAIN, "alice", Some(label))
            .expect("issue zone")
    }

    /// Polls until the store holds `count` records or two seconds pass
    pub async fn wait_for_records(&self, count: usize) -> bool {
        for _ in 0..40 {
            if self.store.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}

pub fn public_ips() -> BTreeSet<IpAddr> {
    BTreeSet::from([IpAddr::V4(PUBLIC_IP)])
}

pub fn user(name: &str) -> User {
    User {
        username: name.to_string(),
        full_name: None,
        roles: Vec::new(),
        password_hash: hash_password_with_cost("password", 4).unwrap(),
    }
}

pub fn admin(name: &str) -> User {
    User {
        roles: vec!["admin".to_string()],
        ..user(name)
    }
}

pub fn identity_with(users: &[User]) -> Arc<Identity> {
    let identity = Arc::new(Identity::new(chrono::Duration::minutes(60)));
    for u in users {
        identity.add_user(u.clone()).expect("add user");
    }
    identity
}

pub fn access(registry: &Arc<ZoneRegistry>) -> AccessControl {
    AccessControl::new(Arc::clone(registry), "dusseldorf")
}

pub fn predicate(name: &str, value: &str) -> RuleComponent {
    RuleComponent {
        actionname: name.to_string(),
        actionvalue: value.to_string(),
        ispredicate: true,
    }
}

pub fn action(name: &str, value: &str) -> RuleComponent {
    RuleComponent {
        actionname: name.to_string(),
        actionvalue: value.to_string(),
        ispredicate: false,
    }
}
