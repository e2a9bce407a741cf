//! ACL + RBAC decision engine behavior.

mod support;

use std::sync::Arc;
use support::*;
use tresor_engine::{
    AclPermission, Error, PermissionEngine, Policy, ResourceManager, RoleMembership, Storage,
};
use tresor_format::Format;

fn engine(policy: Policy) -> Arc<PermissionEngine> {
    Arc::new(PermissionEngine::new(
        memory_storage(),
        memory_storage(),
        policy,
    ))
}

fn guarded_manager(storage: Storage, gate: Arc<PermissionEngine>) -> ResourceManager<Item> {
    ResourceManager::<Item>::builder(storage)
        .name("item")
        .format(Format::Json)
        .indexed_fields(["name", "price"])
        .permission_gate(gate)
        .build()
}

#[tokio::test]
async fn type_level_acl_and_role_expansion() -> anyhow::Result<()> {
    let gate = engine(Policy::strict());
    let admin = ctx_at("user:admin", 0);

    gate.grant(&admin, AclPermission::allow("user:alice", "item", "get"))
        .await?;
    gate.grant(&admin, AclPermission::allow("user:alice", "item", "create"))
        .await?;

    let manager = guarded_manager(memory_storage(), gate.clone());
    let alice = ctx_at("user:alice", 1);
    let bob = ctx_at("user:bob", 1);

    let info = manager.create(&alice, item("thing", 1, &[])).await?;
    assert!(manager.get(&alice, &info.resource_id).await.is_ok());

    // Bob has no applicable rule: strict policy defaults to deny.
    match manager.get(&bob, &info.resource_id).await {
        Err(Error::PermissionDenied { actor, action, .. }) => {
            assert_eq!(actor, "user:bob");
            assert_eq!(action, "get");
        }
        other => panic!("expected PermissionDenied, got {other:?}"),
    }

    // Group membership plus a group rule opens the door.
    gate.add_membership(&admin, RoleMembership::new("user:bob", "group:readers"))
        .await?;
    gate.grant(&admin, AclPermission::allow("group:readers", "item", "get"))
        .await?;
    assert!(manager.get(&bob, &info.resource_id).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn deny_overrides_beats_group_allows() -> anyhow::Result<()> {
    let gate = engine(Policy::strict());
    let admin = ctx_at("user:admin", 0);

    // carol's group may read items, but carol herself is denied first: the
    // direct deny decides before any role walking happens.
    gate.add_membership(&admin, RoleMembership::new("user:carol", "group:readers"))
        .await?;
    gate.grant(&admin, AclPermission::allow("group:readers", "item", "get"))
        .await?;
    gate.grant(&admin, AclPermission::deny("user:carol", "item", "get"))
        .await?;

    let manager = guarded_manager(memory_storage(), gate.clone());
    gate.grant(&admin, AclPermission::allow("user:carol", "item", "create"))
        .await?;
    let carol = ctx_at("user:carol", 1);
    let info = manager.create(&carol, item("secret", 1, &[])).await?;

    match manager.get(&carol, &info.resource_id).await {
        Err(Error::PermissionDenied { .. }) => Ok(()),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn resource_id_rules_outrank_type_rules() -> anyhow::Result<()> {
    let gate = engine(Policy::strict());
    let admin = ctx_at("user:admin", 0);
    gate.grant(&admin, AclPermission::allow("user:dave", "item", "create"))
        .await?;
    gate.grant(&admin, AclPermission::allow("user:dave", "item", "get"))
        .await?;

    let manager = guarded_manager(memory_storage(), gate.clone());
    let dave = ctx_at("user:dave", 1);
    let info = manager.create(&dave, item("mine", 1, &[])).await?;

    // A deny on the exact resource id wins over the type-level allow
    // because the id candidate is evaluated first.
    gate.grant(
        &admin,
        AclPermission::deny("user:dave", info.resource_id.clone(), "get"),
    )
    .await?;
    match manager.get(&dave, &info.resource_id).await {
        Err(Error::PermissionDenied { .. }) => Ok(()),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn wildcard_subjects_and_objects_apply() -> anyhow::Result<()> {
    let gate = engine(Policy::strict());
    let admin = ctx_at("user:admin", 0);

    gate.grant(&admin, AclPermission::allow("*", "*", "get"))
        .await?;
    gate.grant(&admin, AclPermission::allow("user:erin", "*", "create"))
        .await?;

    let manager = guarded_manager(memory_storage(), gate.clone());
    let erin = ctx_at("user:erin", 1);
    let info = manager.create(&erin, item("shared", 1, &[])).await?;

    let anyone = ctx_at("user:frank", 2);
    assert!(manager.get(&anyone, &info.resource_id).await.is_ok());

    // The wildcard covers get only.
    match manager.delete(&anyone, &info.resource_id).await {
        Err(Error::PermissionDenied { .. }) => Ok(()),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn wildcard_action_grants_everything_on_the_type() -> anyhow::Result<()> {
    let gate = engine(Policy::strict());
    let admin = ctx_at("user:admin", 0);
    gate.grant(&admin, AclPermission::allow("user:gail", "item", "*"))
        .await?;

    let manager = guarded_manager(memory_storage(), gate.clone());
    let gail = ctx_at("user:gail", 1);
    let info = manager.create(&gail, item("w", 1, &[])).await?;
    manager.update(&gail, &info.resource_id, item("w2", 2, &[])).await?;
    manager.delete(&gail, &info.resource_id).await?;
    manager.restore(&gail, &info.resource_id).await?;
    Ok(())
}

#[tokio::test]
async fn cyclic_role_graphs_terminate() -> anyhow::Result<()> {
    let gate = engine(Policy::strict());
    let admin = ctx_at("user:admin", 0);

    // a -> b -> c -> a plus an unrelated allow for the walk to find.
    gate.add_membership(&admin, RoleMembership::new("user:hank", "group:a"))
        .await?;
    gate.add_membership(&admin, RoleMembership::new("group:a", "group:b"))
        .await?;
    gate.add_membership(&admin, RoleMembership::new("group:b", "group:c"))
        .await?;
    gate.add_membership(&admin, RoleMembership::new("group:c", "group:a"))
        .await?;
    gate.grant(&admin, AclPermission::allow("group:c", "item", "get"))
        .await?;
    gate.grant(&admin, AclPermission::allow("user:hank", "item", "create"))
        .await?;

    let manager = guarded_manager(memory_storage(), gate.clone());
    let hank = ctx_at("user:hank", 1);
    let info = manager.create(&hank, item("loop", 1, &[])).await?;

    // Terminates despite the cycle, and the transitive allow is found.
    assert!(manager.get(&hank, &info.resource_id).await.is_ok());

    // An action nobody grants still terminates, at the default.
    match manager.migrate(&hank, &info.resource_id).await {
        Err(Error::PermissionDenied { .. }) => Ok(()),
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

#[tokio::test]
async fn root_users_bypass_evaluation() -> anyhow::Result<()> {
    let gate = Arc::new(
        PermissionEngine::new(memory_storage(), memory_storage(), Policy::strict())
            .with_root_users(["user:root"]),
    );
    let manager = guarded_manager(memory_storage(), gate);
    let root = ctx_at("user:root", 0);

    let info = manager.create(&root, item("anything", 1, &[])).await?;
    assert!(manager.get(&root, &info.resource_id).await.is_ok());
    assert!(manager.delete(&root, &info.resource_id).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn permissive_policy_defaults_to_allow() -> anyhow::Result<()> {
    let gate = engine(Policy::permissive());
    let manager = guarded_manager(memory_storage(), gate.clone());
    let ivy = ctx_at("user:ivy", 0);

    // No rules at all: everything is allowed.
    let info = manager.create(&ivy, item("open", 1, &[])).await?;
    assert!(manager.get(&ivy, &info.resource_id).await.is_ok());

    // Under allow_overrides an allow beats a coexisting deny.
    let admin = ctx_at("user:admin", 1);
    gate.grant(&admin, AclPermission::deny("user:ivy", "item", "get"))
        .await?;
    gate.grant(&admin, AclPermission::allow("user:ivy", "item", "get"))
        .await?;
    assert!(manager.get(&ivy, &info.resource_id).await.is_ok());
    Ok(())
}
