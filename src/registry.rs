//! Zone registry: domains, issued zones and hostname routing
//!
//! Domain and zone names are claimed through atomic map entries, so two
//! concurrent issuers can never both own the same fqdn. Routing reads go
//! through an immutable snapshot that is swapped as a whole whenever a zone
//! appears or disappears.

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, VigilError};
use crate::models::{Domain, Zone};

/// Attempts at drawing a fresh random label before giving up
const MAX_LABEL_ATTEMPTS: usize = 8;

/// Longest name accepted anywhere in the registry (RFC 1035)
const MAX_NAME_LEN: usize = 253;

/// A resolved zone together with its parent domain
#[derive(Debug, Clone)]
pub struct ZoneMatch {
    pub zone: Arc<Zone>,
    pub domain: Arc<Domain>,
}

#[derive(Debug, Default, Clone)]
struct ResolveIndex {
    zones: HashMap<String, Arc<Zone>>,
    domains: HashMap<String, Arc<Domain>>,
}

/// Authority for domain and zone ownership
pub struct ZoneRegistry {
    domains: DashMap<String, Domain>,
    zones: DashMap<String, Zone>,
    index: ArcSwap<ResolveIndex>,
}

impl Default for ZoneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self {
            domains: DashMap::new(),
            zones: DashMap::new(),
            index: ArcSwap::from_pointee(ResolveIndex::default()),
        }
    }

    /// Registers a root domain; fails with `Conflict` if the name is taken
    pub fn register_domain(
        &self,
        name: &str,
        public_ips: BTreeSet<IpAddr>,
        owner: &str,
    ) -> Result<Domain> {
        let name = normalize_name(name);
        if !is_valid_dns_name(&name) {
            return Err(VigilError::MalformedInput(format!(
                "'{name}' is not a valid domain name"
            )));
        }

        let domain = Domain {
            domain: name.clone(),
            public_ips,
            owner: owner.to_string(),
            users: Vec::new(),
        };

        match self.domains.entry(name.clone()) {
            Entry::Occupied(_) => return Err(VigilError::Conflict(format!("domain {name}"))),
            Entry::Vacant(slot) => {
                slot.insert(domain.clone());
            }
        }

        let published = Arc::new(domain.clone());
        self.index.rcu(|current| {
            let mut next = ResolveIndex::clone(current);
            next.domains.insert(name.clone(), Arc::clone(&published));
            next
        });

        info!("Registered domain {} (owner {})", name, owner);
        Ok(domain)
    }

    /// Adds accounts allowed to issue zones under a domain
    pub fn add_domain_users(&self, name: &str, users: &[String]) -> Result<()> {
        let name = normalize_name(name);
        let mut entry = self
            .domains
            .get_mut(&name)
            .ok_or_else(|| VigilError::NotFound(format!("domain {name}")))?;
        for user in users {
            if !entry.users.contains(user) {
                entry.users.push(user.clone());
            }
        }
        let updated = Arc::new(entry.clone());
        drop(entry);
        self.republish_domain(updated);
        Ok(())
    }

    /// Replaces the public addresses of a domain
    pub fn update_public_ips(&self, name: &str, public_ips: BTreeSet<IpAddr>) -> Result<Domain> {
        let name = normalize_name(name);
        let mut entry = self
            .domains
            .get_mut(&name)
            .ok_or_else(|| VigilError::NotFound(format!("domain {name}")))?;
        entry.public_ips = public_ips;
        let updated = entry.clone();
        drop(entry);
        self.republish_domain(Arc::new(updated.clone()));
        Ok(updated)
    }

    fn republish_domain(&self, domain: Arc<Domain>) {
        self.index.rcu(|current| {
            let mut next = ResolveIndex::clone(current);
            next.domains.insert(domain.domain.clone(), Arc::clone(&domain));
            next
        });
    }

    /// Issues a new zone under `domain`
    ///
    /// With no `label` a random 12-character hex label is drawn until an
    /// unused fqdn is found. A caller-chosen label that is already taken
    /// fails with `Conflict`.
    pub fn issue_zone(&self, domain: &str, owner: &str, label: Option<&str>) -> Result<Zone> {
        let domain = normalize_name(domain);
        if !self.domains.contains_key(&domain) {
            return Err(VigilError::NotFound(format!("domain {domain}")));
        }

        match label {
            Some(label) => {
                let label = normalize_name(label);
                if !is_valid_label(&label) {
                    return Err(VigilError::MalformedInput(format!(
                        "'{label}' is not a valid DNS label"
                    )));
                }
                self.claim_zone(&domain, owner, &label)
            }
            None => {
                for _ in 0..MAX_LABEL_ATTEMPTS {
                    match self.claim_zone(&domain, owner, &generate_label()) {
                        Err(VigilError::Conflict(fqdn)) => {
                            debug!("Label collision on {}, drawing again", fqdn);
                        }
                        other => return other,
                    }
                }
                Err(VigilError::Conflict(format!(
                    "no free label under {domain} after {MAX_LABEL_ATTEMPTS} attempts"
                )))
            }
        }
    }

    fn claim_zone(&self, domain: &str, owner: &str, label: &str) -> Result<Zone> {
        let fqdn = format!("{label}.{domain}");
        if fqdn.len() > MAX_NAME_LEN {
            return Err(VigilError::MalformedInput(format!("{fqdn} is too long")));
        }

        let zone = Zone {
            fqdn: fqdn.clone(),
            domain: domain.to_string(),
            owner: owner.to_string(),
            created_at: Utc::now(),
            deleted_at: None,
        };

        match self.zones.entry(fqdn.clone()) {
            Entry::Occupied(_) => return Err(VigilError::Conflict(format!("zone {fqdn}"))),
            Entry::Vacant(slot) => {
                slot.insert(zone.clone());
            }
        }

        let published = Arc::new(zone.clone());
        self.index.rcu(|current| {
            let mut next = ResolveIndex::clone(current);
            next.zones.insert(fqdn.clone(), Arc::clone(&published));
            next
        });

        info!("Issued zone {} to {}", fqdn, owner);
        Ok(zone)
    }

    /// Finds the most specific live zone that `hostname` equals or falls under
    pub fn resolve(&self, hostname: &str) -> Option<ZoneMatch> {
        let name = normalize_name(hostname);
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return None;
        }
        let index = self.index.load();

        for suffix in suffixes(&name) {
            if let Some(zone) = index.zones.get(suffix) {
                let domain = index.domains.get(&zone.domain)?;
                return Some(ZoneMatch {
                    zone: Arc::clone(zone),
                    domain: Arc::clone(domain),
                });
            }
        }
        None
    }

    /// Finds the registered domain a hostname belongs to, zone or not
    pub fn domain_for(&self, hostname: &str) -> Option<Arc<Domain>> {
        let name = normalize_name(hostname);
        let index = self.index.load();
        let found = suffixes(&name).find_map(|suffix| index.domains.get(suffix).cloned());
        found
    }

    /// Soft-deletes a zone: it stops resolving but its name stays reserved
    pub fn delete_zone(&self, fqdn: &str) -> Result<Zone> {
        let fqdn = normalize_name(fqdn);
        let mut entry = self
            .zones
            .get_mut(&fqdn)
            .filter(|z| !z.is_deleted())
            .ok_or_else(|| VigilError::NotFound(format!("zone {fqdn}")))?;
        entry.deleted_at = Some(Utc::now());
        let deleted = entry.clone();
        drop(entry);

        self.index.rcu(|current| {
            let mut next = ResolveIndex::clone(current);
            next.zones.remove(&fqdn);
            next
        });

        info!("Deleted zone {}", fqdn);
        Ok(deleted)
    }

    /// Removes a domain and soft-deletes every zone under it
    pub fn delete_domain(&self, name: &str) -> Result<Domain> {
        let name = normalize_name(name);
        let (_, domain) = self
            .domains
            .remove(&name)
            .ok_or_else(|| VigilError::NotFound(format!("domain {name}")))?;

        let now = Utc::now();
        let mut removed = Vec::new();
        for mut zone in self.zones.iter_mut() {
            if zone.domain == name && !zone.is_deleted() {
                zone.deleted_at = Some(now);
                removed.push(zone.fqdn.clone());
            }
        }

        self.index.rcu(|current| {
            let mut next = ResolveIndex::clone(current);
            next.domains.remove(&name);
            for fqdn in &removed {
                next.zones.remove(fqdn);
            }
            next
        });

        info!("Deleted domain {} and {} zone(s)", name, removed.len());
        Ok(domain)
    }

    pub fn domain(&self, name: &str) -> Option<Domain> {
        self.domains.get(&normalize_name(name)).map(|d| d.clone())
    }

    /// Looks up a zone record, including soft-deleted ones
    pub fn zone(&self, fqdn: &str) -> Option<Zone> {
        self.zones.get(&normalize_name(fqdn)).map(|z| z.clone())
    }

    /// All registered domains, sorted by name
    pub fn domains(&self) -> Vec<Domain> {
        let mut all: Vec<Domain> = self.domains.iter().map(|d| d.clone()).collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    /// All live zones, sorted by name
    pub fn zones(&self) -> Vec<Zone> {
        let mut all: Vec<Zone> = self
            .zones
            .iter()
            .filter(|z| !z.is_deleted())
            .map(|z| z.clone())
            .collect();
        all.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));
        all
    }

    /// Every zone ever issued, soft-deleted ones included
    pub fn all_zones(&self) -> Vec<Zone> {
        let mut all: Vec<Zone> = self.zones.iter().map(|z| z.clone()).collect();
        all.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));
        all
    }

    /// Replaces the registry contents with a saved catalog
    ///
    /// Zones whose domain is missing are kept as reserved names but do not
    /// route.
    pub fn restore(&self, domains: Vec<Domain>, zones: Vec<Zone>) {
        self.domains.clear();
        self.zones.clear();

        let mut index = ResolveIndex::default();
        for domain in domains {
            let name = normalize_name(&domain.domain);
            index.domains.insert(name.clone(), Arc::new(domain.clone()));
            self.domains.insert(name, domain);
        }
        for zone in zones {
            let fqdn = normalize_name(&zone.fqdn);
            if !zone.is_deleted() && index.domains.contains_key(&zone.domain) {
                index.zones.insert(fqdn.clone(), Arc::new(zone.clone()));
            }
            self.zones.insert(fqdn, zone);
        }

        debug!(
            "Restored {} domain(s) and {} routable zone(s)",
            index.domains.len(),
            index.zones.len()
        );
        self.index.store(Arc::new(index));
    }
}

/// Lowercases a DNS name and strips the root dot
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Checks a single label: 1-63 chars of letters, digits, '-' or '_'
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Checks a full name made of valid labels
pub fn is_valid_dns_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LEN && name.split('.').all(is_valid_label)
}

/// Draws a random 12-character hex label
pub fn generate_label() -> String {
    let hex = format!("{:032x}", uuid::Uuid::new_v4().as_u128());
    hex[..12].to_string()
}

/// Yields `a.b.c`, `b.c`, `c` for `a.b.c`
fn suffixes(name: &str) -> impl Iterator<Item = &str> {
    std::iter::once(name).chain(
        name.match_indices('.')
            .map(move |(i, _)| &name[i + 1..]),
    )
}
