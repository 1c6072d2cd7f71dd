//! Per-zone permission table
//!
//! Management operations pass through here; listeners never do, since
//! probes are anonymous.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, VigilError};
use crate::models::{Permission, User, Zone};
use crate::registry::{normalize_name, ZoneRegistry};

/// Saved grants: zone fqdn to username to level
pub type ZoneGrants = BTreeMap<String, BTreeMap<String, Permission>>;

/// Owner name that marks a domain as open to every user
pub const DEFAULT_PUBLIC_OWNER: &str = "dusseldorf";

/// Grants and hierarchy checks for zones and domains
pub struct AccessControl {
    registry: Arc<ZoneRegistry>,
    zone_grants: DashMap<String, BTreeMap<String, Permission>>,
    public_owner: String,
}

impl AccessControl {
    pub fn new(registry: Arc<ZoneRegistry>, public_owner: impl Into<String>) -> Self {
        Self {
            registry,
            zone_grants: DashMap::new(),
            public_owner: public_owner.into(),
        }
    }

    /// Effective permission of `user` on a zone, if any
    ///
    /// Owning the parent domain counts as owning every zone under it.
    pub fn zone_level(&self, user: &User, fqdn: &str) -> Result<Option<Permission>> {
        let fqdn = normalize_name(fqdn);
        let zone = self
            .registry
            .zone(&fqdn)
            .ok_or_else(|| VigilError::NotFound(format!("zone {fqdn}")))?;

        if user.is_admin() {
            return Ok(Some(Permission::Owner));
        }

        let domain_owner = self
            .registry
            .domain(&zone.domain)
            .is_some_and(|d| d.owner == user.username);
        if domain_owner {
            return Ok(Some(Permission::Owner));
        }

        Ok(self
            .zone_grants
            .get(&fqdn)
            .and_then(|grants| grants.get(&user.username).copied()))
    }

    /// Effective permission of `user` on a domain, if any
    pub fn domain_level(&self, user: &User, domain: &str) -> Result<Option<Permission>> {
        let name = normalize_name(domain);
        let domain = self
            .registry
            .domain(&name)
            .ok_or_else(|| VigilError::NotFound(format!("domain {name}")))?;

        let level = if user.is_admin() || domain.owner == user.username {
            Some(Permission::Owner)
        } else if domain.users.contains(&user.username) || domain.owner == self.public_owner {
            Some(Permission::ReadWrite)
        } else {
            None
        };
        Ok(level)
    }

    /// Allows the call only if the user's level on the zone is at least `required`
    pub fn authorize(&self, user: &User, fqdn: &str, required: Permission) -> Result<()> {
        match self.zone_level(user, fqdn)? {
            Some(level) if level >= required => Ok(()),
            _ => {
                warn!(
                    "User {} denied {} on zone {}",
                    user.username, required, fqdn
                );
                Err(VigilError::Forbidden(format!(
                    "{} requires {} on {}",
                    user.username, required, fqdn
                )))
            }
        }
    }

    /// Allows the call only if the user's level on the domain is at least `required`
    pub fn authorize_domain(&self, user: &User, domain: &str, required: Permission) -> Result<()> {
        match self.domain_level(user, domain)? {
            Some(level) if level >= required => Ok(()),
            _ => {
                warn!(
                    "User {} denied {} on domain {}",
                    user.username, required, domain
                );
                Err(VigilError::Forbidden(format!(
                    "{} requires {} on {}",
                    user.username, required, domain
                )))
            }
        }
    }

    /// Records the issuer of a fresh zone as its owner
    pub fn assign_owner(&self, zone: &Zone) {
        self.zone_grants
            .entry(zone.fqdn.clone())
            .or_default()
            .insert(zone.owner.clone(), Permission::Owner);
    }

    /// Gives `target` a permission on a zone
    ///
    /// The actor needs ASSIGNROLES and cannot hand out more than they hold.
    pub fn grant(&self, actor: &User, fqdn: &str, target: &str, level: Permission) -> Result<()> {
        let fqdn = normalize_name(fqdn);
        let actor_level = self.require_assigner(actor, &fqdn)?;
        if level > actor_level {
            return Err(VigilError::Forbidden(format!(
                "{} cannot grant {} while holding {}",
                actor.username, level, actor_level
            )));
        }

        self.zone_grants
            .entry(fqdn.clone())
            .or_default()
            .insert(target.to_string(), level);
        info!("{} granted {} on {} to {}", actor.username, level, fqdn, target);
        Ok(())
    }

    /// Removes `target`'s explicit permission on a zone
    pub fn revoke(&self, actor: &User, fqdn: &str, target: &str) -> Result<()> {
        let fqdn = normalize_name(fqdn);
        let actor_level = self.require_assigner(actor, &fqdn)?;

        let mut grants = self
            .zone_grants
            .get_mut(&fqdn)
            .ok_or_else(|| VigilError::NotFound(format!("{target} on zone {fqdn}")))?;
        let current = grants
            .get(target)
            .copied()
            .ok_or_else(|| VigilError::NotFound(format!("{target} on zone {fqdn}")))?;
        if current > actor_level {
            return Err(VigilError::Forbidden(format!(
                "{} cannot revoke {} from {}",
                actor.username, current, target
            )));
        }
        grants.remove(target);
        info!("{} revoked {} on {}", actor.username, target, fqdn);
        Ok(())
    }

    fn require_assigner(&self, actor: &User, fqdn: &str) -> Result<Permission> {
        match self.zone_level(actor, fqdn)? {
            Some(level) if level >= Permission::AssignRoles => Ok(level),
            _ => Err(VigilError::Forbidden(format!(
                "{} requires {} on {}",
                actor.username,
                Permission::AssignRoles,
                fqdn
            ))),
        }
    }

    /// Explicit grants on a zone plus the parent domain's owner
    pub fn users_for_zone(&self, fqdn: &str) -> Result<Vec<(String, Permission)>> {
        let fqdn = normalize_name(fqdn);
        let zone = self
            .registry
            .zone(&fqdn)
            .ok_or_else(|| VigilError::NotFound(format!("zone {fqdn}")))?;

        let mut users: BTreeMap<String, Permission> = self
            .zone_grants
            .get(&fqdn)
            .map(|g| g.clone())
            .unwrap_or_default();
        if let Some(domain) = self.registry.domain(&zone.domain) {
            if domain.owner != self.public_owner {
                users.insert(domain.owner, Permission::Owner);
            }
        }
        Ok(users.into_iter().collect())
    }

    /// Live zones the user holds any permission on
    pub fn visible_zones(&self, user: &User) -> Vec<Zone> {
        self.registry
            .zones()
            .into_iter()
            .filter(|z| matches!(self.zone_level(user, &z.fqdn), Ok(Some(_))))
            .collect()
    }

    /// Snapshot of every zone grant
    pub fn grants(&self) -> ZoneGrants {
        self.zone_grants
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Replaces all zone grants with a saved snapshot
    pub fn restore_grants(&self, grants: ZoneGrants) {
        self.zone_grants.clear();
        for (fqdn, users) in grants {
            self.zone_grants.insert(normalize_name(&fqdn), users);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_restored_grants_authorize() {
        let registry = Arc::new(ZoneRegistry::new());
        registry.register_domain("ssrf.uk", BTreeSet::new(), "root").unwrap();
        let zone = registry.issue_zone("ssrf.uk", "alice", Some("abc")).unwrap();

        let before = AccessControl::new(Arc::clone(&registry), DEFAULT_PUBLIC_OWNER);
        before.assign_owner(&zone);
        let saved = before.grants();

        let after = AccessControl::new(registry, DEFAULT_PUBLIC_OWNER);
        let alice = User {
            username: "alice".to_string(),
            full_name: None,
            roles: Vec::new(),
            password_hash: String::new(),
        };
        assert!(after.authorize(&alice, "abc.ssrf.uk", Permission::ReadOnly).is_err());
        after.restore_grants(saved);
        assert!(after.authorize(&alice, "abc.ssrf.uk", Permission::Owner).is_ok());
    }
}
