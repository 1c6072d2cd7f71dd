//! Tests for zone permissions and grant hierarchy

mod common;

use common::{access, admin, public_ips, user, Fixture, DOMAIN};
use vigil::error::VigilError;
use vigil::models::Permission;

#[test]
fn test_readonly_user_cannot_grant() {
    let fx = Fixture::new();
    let acl = access(&fx.registry);
    let alice = user("alice");
    let bob = user("bob");

    let zone = fx.zone("abc");
    acl.assign_owner(&zone);
    acl.grant(&alice, &zone.fqdn, "bob", Permission::ReadOnly).unwrap();

    let denied = acl.grant(&bob, &zone.fqdn, "carol", Permission::ReadOnly);
    assert!(matches!(denied, Err(VigilError::Forbidden(_))));

    acl.grant(&alice, &zone.fqdn, "bob", Permission::ReadWrite).unwrap();
    let users = acl.users_for_zone(&zone.fqdn).unwrap();
    assert!(users.contains(&("bob".to_string(), Permission::ReadWrite)));
    assert!(users.contains(&("alice".to_string(), Permission::Owner)));
}

#[test]
fn test_grant_cannot_exceed_own_level() {
    let fx = Fixture::new();
    let acl = access(&fx.registry);
    let alice = user("alice");
    let bob = user("bob");

    let zone = fx.zone("abc");
    acl.assign_owner(&zone);
    acl.grant(&alice, &zone.fqdn, "bob", Permission::AssignRoles).unwrap();

    assert!(acl.grant(&bob, &zone.fqdn, "carol", Permission::ReadWrite).is_ok());
    assert!(matches!(
        acl.grant(&bob, &zone.fqdn, "carol", Permission::Owner),
        Err(VigilError::Forbidden(_))
    ));
    assert!(matches!(
        acl.revoke(&bob, &zone.fqdn, "alice"),
        Err(VigilError::Forbidden(_))
    ));
    acl.revoke(&bob, &zone.fqdn, "carol").unwrap();
    assert!(matches!(
        acl.revoke(&bob, &zone.fqdn, "carol"),
        Err(VigilError::NotFound(_))
    ));
}

#[test]
fn test_authorize_levels() {
    let fx = Fixture::new();
    let acl = access(&fx.registry);
    let alice = user("alice");
    let bob = user("bob");
    let mallory = user("mallory");

    let zone = fx.zone("abc");
    acl.assign_owner(&zone);
    acl.grant(&alice, &zone.fqdn, "bob", Permission::ReadOnly).unwrap();

    assert!(acl.authorize(&bob, &zone.fqdn, Permission::ReadOnly).is_ok());
    assert!(acl.authorize(&bob, &zone.fqdn, Permission::ReadWrite).is_err());
    assert!(acl.authorize(&mallory, &zone.fqdn, Permission::ReadOnly).is_err());
    assert!(acl.authorize(&admin("root"), &zone.fqdn, Permission::Owner).is_ok());
    assert!(matches!(
        acl.authorize(&alice, "missing.ssrf.uk", Permission::ReadOnly),
        Err(VigilError::NotFound(_))
    ));
}

#[test]
fn test_domain_owner_owns_every_zone() {
    let fx = Fixture::new();
    fx.registry
        .register_domain("private.test", public_ips(), "carol")
        .unwrap();
    let zone = fx
        .registry
        .issue_zone("private.test", "alice", Some("x"))
        .unwrap();
    let acl = access(&fx.registry);
    acl.assign_owner(&zone);

    assert_eq!(
        acl.zone_level(&user("carol"), &zone.fqdn).unwrap(),
        Some(Permission::Owner)
    );
    assert_eq!(acl.zone_level(&user("bob"), &zone.fqdn).unwrap(), None);
}

#[test]
fn test_domain_levels() {
    let fx = Fixture::new();
    fx.registry
        .register_domain("private.test", public_ips(), "carol")
        .unwrap();
    fx.registry
        .add_domain_users("private.test", &["dave".to_string()])
        .unwrap();
    let acl = access(&fx.registry);

    // public domains are writable by anyone
    assert_eq!(
        acl.domain_level(&user("bob"), DOMAIN).unwrap(),
        Some(Permission::ReadWrite)
    );
    assert_eq!(
        acl.domain_level(&user("carol"), "private.test").unwrap(),
        Some(Permission::Owner)
    );
    assert_eq!(
        acl.domain_level(&user("dave"), "private.test").unwrap(),
        Some(Permission::ReadWrite)
    );
    assert_eq!(acl.domain_level(&user("bob"), "private.test").unwrap(), None);
}

#[test]
fn test_visible_zones_and_soft_delete() {
    let fx = Fixture::new();
    let acl = access(&fx.registry);
    let alice = user("alice");
    let bob = user("bob");

    let mine = fx.zone("mine");
    acl.assign_owner(&mine);
    let other = fx.registry.issue_zone(DOMAIN, "bob", Some("other")).unwrap();
    acl.assign_owner(&other);

    let visible: Vec<String> = acl.visible_zones(&alice).into_iter().map(|z| z.fqdn).collect();
    assert_eq!(visible, vec!["mine.ssrf.uk".to_string()]);

    fx.registry.delete_zone(&other.fqdn).unwrap();
    assert!(acl.visible_zones(&bob).is_empty());
    // grants survive soft deletion
    assert_eq!(
        acl.zone_level(&bob, &other.fqdn).unwrap(),
        Some(Permission::Owner)
    );
}
