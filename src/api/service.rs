//! Management operations, each gated by access control

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::access::AccessControl;
use crate::catalog::CatalogSync;
use crate::error::{Result, VigilError};
use crate::identity::Identity;
use crate::models::{Domain, Permission, Protocol, RequestRecord, User, Zone};
use crate::registry::{normalize_name, ZoneRegistry};
use crate::rules::{Rule, RuleComponent, RuleEngine};
use crate::storage::{RequestQuery, RequestStore};

/// Most zones a single issue call may create
pub const MAX_ZONES_PER_REQUEST: usize = 10;

/// A user's permission on a zone, as listed to the UI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneUser {
    pub username: String,
    pub permission: Permission,
}

/// Body of a rule creation request
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(rename = "networkprotocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "rulecomponents", default)]
    pub components: Vec<RuleComponent>,
}

/// Facade over registry, access control, identity, rules and storage
pub struct Management {
    registry: Arc<ZoneRegistry>,
    access: Arc<AccessControl>,
    identity: Arc<Identity>,
    rules: Arc<RuleEngine>,
    store: Arc<dyn RequestStore>,
    catalog: Arc<CatalogSync>,
}

impl Management {
    pub fn new(
        registry: Arc<ZoneRegistry>,
        access: Arc<AccessControl>,
        identity: Arc<Identity>,
        rules: Arc<RuleEngine>,
        store: Arc<dyn RequestStore>,
        catalog: Arc<CatalogSync>,
    ) -> Self {
        Self {
            registry,
            access,
            identity,
            rules,
            store,
            catalog,
        }
    }

    /// Checks credentials off the async workers; bcrypt is slow on purpose
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let identity = Arc::clone(&self.identity);
        let (username, password) = (username.to_string(), password.to_string());
        tokio::task::spawn_blocking(move || identity.login(&username, &password))
            .await
            .map_err(std::io::Error::from)?
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        if self.identity.logout(token) {
            Ok(())
        } else {
            Err(VigilError::Unauthorized("Invalid session".to_string()))
        }
    }

    /// Resolves a bearer token to its user
    pub fn authenticate(&self, token: &str) -> Result<User> {
        self.identity.authenticate(token)
    }

    /// Domains the user may see: owned, shared, public, or all for admins
    pub fn get_domains(&self, user: &User) -> Vec<Domain> {
        self.registry
            .domains()
            .into_iter()
            .filter(|d| matches!(self.access.domain_level(user, &d.domain), Ok(Some(_))))
            .collect()
    }

    /// Registers a root domain; admin only
    pub async fn register_domain(
        &self,
        user: &User,
        name: &str,
        public_ips: BTreeSet<IpAddr>,
        owner: Option<&str>,
        users: &[String],
    ) -> Result<Domain> {
        if !user.is_admin() {
            return Err(VigilError::Forbidden(format!(
                "{} may not register domains",
                user.username
            )));
        }
        let owner = owner.unwrap_or(&user.username);
        let domain = self.registry.register_domain(name, public_ips, owner)?;
        if !users.is_empty() {
            self.registry.add_domain_users(&domain.domain, users)?;
        }
        self.catalog.persist().await?;
        self.registry
            .domain(&domain.domain)
            .ok_or_else(|| VigilError::NotFound(format!("domain {}", domain.domain)))
    }

    pub async fn update_public_ips(
        &self,
        user: &User,
        domain: &str,
        public_ips: BTreeSet<IpAddr>,
    ) -> Result<Domain> {
        self.access
            .authorize_domain(user, domain, Permission::Owner)?;
        let updated = self.registry.update_public_ips(domain, public_ips)?;
        self.catalog.persist().await?;
        Ok(updated)
    }

    /// Removes a domain; its zones stop resolving and lose their rules
    pub async fn delete_domain(&self, user: &User, domain: &str) -> Result<Domain> {
        self.access
            .authorize_domain(user, domain, Permission::Owner)?;
        let name = normalize_name(domain);
        let zones: Vec<String> = self
            .registry
            .zones()
            .into_iter()
            .filter(|z| z.domain == name)
            .map(|z| z.fqdn)
            .collect();
        let removed = self.registry.delete_domain(&name)?;
        for fqdn in zones {
            self.rules.clear_zone(&fqdn);
        }
        self.catalog.persist().await?;
        Ok(removed)
    }

    /// Live zones the user holds any permission on
    pub fn get_zones(&self, user: &User) -> Vec<Zone> {
        self.access.visible_zones(user)
    }

    /// Issues `num` zones under a domain the user may write to
    ///
    /// A custom `label` is only accepted for a single zone.
    pub async fn issue_zones(
        &self,
        user: &User,
        domain: &str,
        num: usize,
        label: Option<&str>,
    ) -> Result<Vec<Zone>> {
        if num == 0 || num > MAX_ZONES_PER_REQUEST {
            return Err(VigilError::MalformedInput(format!(
                "num must be between 1 and {MAX_ZONES_PER_REQUEST}"
            )));
        }
        if label.is_some() && num != 1 {
            return Err(VigilError::MalformedInput(
                "a custom label can only be used for a single zone".to_string(),
            ));
        }
        self.access
            .authorize_domain(user, domain, Permission::ReadWrite)?;

        let mut issued = Vec::with_capacity(num);
        for _ in 0..num {
            let zone = self.registry.issue_zone(domain, &user.username, label)?;
            self.access.assign_owner(&zone);
            issued.push(zone);
        }
        self.catalog.persist().await?;
        Ok(issued)
    }

    /// Soft-deletes a zone; requires OWNER
    pub async fn delete_zone(&self, user: &User, fqdn: &str) -> Result<Zone> {
        self.access.authorize(user, fqdn, Permission::Owner)?;
        let zone = self.registry.delete_zone(fqdn)?;
        self.rules.clear_zone(&zone.fqdn);
        self.catalog.persist().await?;
        Ok(zone)
    }

    /// Users holding a permission on a zone
    pub fn get_users(&self, user: &User, fqdn: &str) -> Result<Vec<ZoneUser>> {
        self.access.authorize(user, fqdn, Permission::ReadOnly)?;
        Ok(self
            .access
            .users_for_zone(fqdn)?
            .into_iter()
            .map(|(username, permission)| ZoneUser {
                username,
                permission,
            })
            .collect())
    }

    /// Every account, for picking grant targets
    pub fn get_all_users(&self, _user: &User) -> Vec<User> {
        self.identity.users()
    }

    pub async fn add_user_to_zone(
        &self,
        user: &User,
        fqdn: &str,
        target: &str,
        permission: Permission,
    ) -> Result<()> {
        if self.identity.user(target).is_none() {
            return Err(VigilError::NotFound(format!("user {target}")));
        }
        self.access.grant(user, fqdn, target, permission)?;
        self.catalog.persist().await
    }

    pub async fn remove_user_from_zone(&self, user: &User, fqdn: &str, target: &str) -> Result<()> {
        self.access.revoke(user, fqdn, target)?;
        self.catalog.persist().await
    }

    /// Captured requests of a zone, oldest first unless asked otherwise
    pub async fn get_requests(
        &self,
        user: &User,
        zone: &str,
        query: &RequestQuery,
    ) -> Result<Vec<RequestRecord>> {
        self.access.authorize(user, zone, Permission::ReadOnly)?;
        self.store.query(&normalize_name(zone), query).await
    }

    /// One captured request identified by its capture time
    pub async fn get_request(
        &self,
        user: &User,
        zone: &str,
        time: DateTime<Utc>,
    ) -> Result<RequestRecord> {
        self.access.authorize(user, zone, Permission::ReadOnly)?;
        let zone = normalize_name(zone);
        self.store
            .get(&zone, time)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("request at {time} in {zone}")))
    }

    pub fn get_rules(&self, user: &User, zone: &str) -> Result<Vec<Rule>> {
        self.access.authorize(user, zone, Permission::ReadOnly)?;
        Ok(self.rules.rules_for(zone).to_vec())
    }

    /// Validates and installs a rule on a live zone
    pub async fn add_rule(&self, user: &User, zone: &str, new_rule: &NewRule) -> Result<Rule> {
        self.access.authorize(user, zone, Permission::ReadWrite)?;
        let live = self.registry.zone(zone).is_some_and(|z| !z.is_deleted());
        if !live {
            return Err(VigilError::NotFound(format!("zone {}", normalize_name(zone))));
        }
        let rule = Rule::new(
            zone,
            &new_rule.name,
            new_rule.protocol,
            new_rule.priority,
            &new_rule.components,
        )?;
        self.rules.add_rule(rule.clone());
        self.catalog.persist().await?;
        info!("{} added rule {} to {}", user.username, rule.id, rule.zone);
        Ok(rule)
    }

    pub async fn delete_rule(&self, user: &User, zone: &str, id: Uuid) -> Result<()> {
        self.access.authorize(user, zone, Permission::ReadWrite)?;
        self.rules.remove_rule(zone, id)?;
        self.catalog.persist().await
    }
}
