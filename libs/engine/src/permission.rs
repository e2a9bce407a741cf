//! ACL + role-membership permission engine.
//!
//! Permission records are resources themselves: the engine owns two
//! unguarded resource managers, one for [`AclPermission`] rows and one for
//! [`RoleMembership`] edges, both with indexed fields so decisions are
//! plain meta-store queries. Evaluation walks candidate objects in priority
//! order (exact resource id, resource type, `"*"`, null) and expands the
//! subject through role memberships with an iterative breadth-first walk —
//! a visited set keeps cyclic role graphs from looping.

use crate::context::OpContext;
use crate::error::Result;
use crate::manager::ResourceManager;
use crate::storage::Storage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tresor_query::Qb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

/// One access-control row. `subject` is `"user:alice"`, `"group:admins"`,
/// `"service:foo"` or `"*"`; `object` is a resource id, a resource-type
/// name, `"*"`, or null; `action` is an operation verb or `"*"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AclPermission {
    pub subject: String,
    pub object: Option<String>,
    pub action: String,
    #[serde(default)]
    pub effect: Effect,
    #[serde(default)]
    pub order: Option<i64>,
}

impl AclPermission {
    pub fn allow(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        AclPermission {
            subject: subject.into(),
            object: Some(object.into()),
            action: action.into(),
            effect: Effect::Allow,
            order: None,
        }
    }

    pub fn deny(
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        AclPermission {
            effect: Effect::Deny,
            ..AclPermission::allow(subject, object, action)
        }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }
}

/// RBAC graph edge: `subject` belongs to `group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleMembership {
    pub subject: String,
    pub group: String,
    #[serde(default)]
    pub order: Option<i64>,
}

impl RoleMembership {
    pub fn new(subject: impl Into<String>, group: impl Into<String>) -> Self {
        RoleMembership {
            subject: subject.into(),
            group: group.into(),
            order: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombiningAlgorithm {
    /// Any applicable deny wins.
    DenyOverrides,
    /// Any applicable allow wins.
    AllowOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub combining: CombiningAlgorithm,
    pub default_effect: Effect,
}

impl Policy {
    /// `deny_overrides` + `default_deny`.
    pub fn strict() -> Self {
        Policy {
            combining: CombiningAlgorithm::DenyOverrides,
            default_effect: Effect::Deny,
        }
    }

    /// `allow_overrides` + `default_allow`.
    pub fn permissive() -> Self {
        Policy {
            combining: CombiningAlgorithm::AllowOverrides,
            default_effect: Effect::Allow,
        }
    }
}

/// What an operation is about to touch.
#[derive(Debug, Clone, Copy)]
pub struct PermissionObject<'a> {
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
}

/// Decision interface the resource manager calls on every guarded
/// operation. Implemented by [`PermissionEngine`]; callers can plug their
/// own.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check(
        &self,
        ctx: &OpContext,
        action: &str,
        object: PermissionObject<'_>,
    ) -> Result<Effect>;
}

pub struct PermissionEngine {
    acl: ResourceManager<AclPermission>,
    roles: ResourceManager<RoleMembership>,
    policy: Policy,
    root_users: HashSet<String>,
}

/// Upper bound on rows fetched per ACL lookup.
const RULE_FETCH_LIMIT: u32 = 1_000;

impl PermissionEngine {
    /// `acl_storage` and `role_storage` back the permission resources; they
    /// are ordinary storages (the rules eat their own dog food) but the
    /// internal managers carry no permission gate of their own.
    pub fn new(acl_storage: Storage, role_storage: Storage, policy: Policy) -> Self {
        let acl = ResourceManager::<AclPermission>::builder(acl_storage)
            .name("acl_permission")
            .indexed_fields(["subject", "object", "action", "effect", "order"])
            .build();
        let roles = ResourceManager::<RoleMembership>::builder(role_storage)
            .name("role_membership")
            .indexed_fields(["subject", "group", "order"])
            .build();
        PermissionEngine {
            acl,
            roles,
            policy,
            root_users: HashSet::new(),
        }
    }

    /// Actors that bypass evaluation entirely.
    pub fn with_root_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.root_users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub async fn grant(&self, ctx: &OpContext, rule: AclPermission) -> Result<()> {
        self.acl.create(ctx, rule).await?;
        Ok(())
    }

    pub async fn add_membership(&self, ctx: &OpContext, membership: RoleMembership) -> Result<()> {
        self.roles.create(ctx, membership).await?;
        Ok(())
    }

    /// Direct access to the rule managers, e.g. for listing or revoking.
    pub fn acl_manager(&self) -> &ResourceManager<AclPermission> {
        &self.acl
    }

    pub fn role_manager(&self) -> &ResourceManager<RoleMembership> {
        &self.roles
    }

    /// Candidate objects in priority order: exact id, type name, `"*"`,
    /// null.
    fn candidate_objects<'a>(object: &PermissionObject<'a>) -> Vec<Option<&'a str>> {
        let mut candidates = Vec::with_capacity(4);
        if let Some(id) = object.resource_id {
            candidates.push(Some(id));
        }
        candidates.push(Some(object.resource_type));
        candidates.push(Some("*"));
        candidates.push(None);
        candidates
    }

    /// ACL rows for one (subject, object candidate) pair, order-sorted.
    /// Rules with subject `"*"` apply to every subject.
    async fn rules_for(
        &self,
        ctx: &OpContext,
        subject: &str,
        candidate: Option<&str>,
    ) -> Result<Vec<AclPermission>> {
        let subject_cond = Qb::field("subject").in_list([subject, "*"]);
        let object_cond = match candidate {
            Some(object) => Qb::field("object").eq(object),
            None => Qb::field("object").isna(true),
        };
        let query = (subject_cond & object_cond)
            .limit(RULE_FETCH_LIMIT)
            .build();

        let metas = self.acl.storage().search(&query).await?;
        use futures::TryStreamExt;
        let metas: Vec<_> = metas.try_collect().await?;

        let mut rules = Vec::with_capacity(metas.len());
        for meta in metas {
            match self
                .acl
                .get_revision(ctx, &meta.resource_id, &meta.current_revision_id)
                .await
            {
                Ok(resource) => rules.push(resource.data),
                Err(err) => {
                    tracing::warn!(resource_id = %meta.resource_id, error = %err, "skipping unreadable ACL rule");
                }
            }
        }
        rules.sort_by_key(|rule| rule.order.unwrap_or(i64::MAX));
        Ok(rules)
    }

    /// Groups the subject directly belongs to.
    async fn groups_of(&self, ctx: &OpContext, subject: &str) -> Result<Vec<String>> {
        let query = Qb::field("subject").eq(subject).limit(RULE_FETCH_LIMIT).build();
        let metas = self.roles.storage().search(&query).await?;
        use futures::TryStreamExt;
        let metas: Vec<_> = metas.try_collect().await?;

        let mut groups = Vec::with_capacity(metas.len());
        for meta in metas {
            match self
                .roles
                .get_revision(ctx, &meta.resource_id, &meta.current_revision_id)
                .await
            {
                Ok(resource) => groups.push(resource.data.group),
                Err(err) => {
                    tracing::warn!(resource_id = %meta.resource_id, error = %err, "skipping unreadable role membership");
                }
            }
        }
        Ok(groups)
    }

    /// First decisive match wins, scanning candidates in priority order;
    /// the combining algorithm settles conflicts within one candidate.
    fn decide_candidate(&self, rules: &[AclPermission], action: &str) -> Option<Effect> {
        let applicable = rules
            .iter()
            .filter(|rule| rule.action == action || rule.action == "*");

        let mut saw_allow = false;
        let mut saw_deny = false;
        for rule in applicable {
            match (rule.effect, self.policy.combining) {
                (Effect::Deny, CombiningAlgorithm::DenyOverrides) => return Some(Effect::Deny),
                (Effect::Allow, CombiningAlgorithm::AllowOverrides) => return Some(Effect::Allow),
                (Effect::Allow, _) => saw_allow = true,
                (Effect::Deny, _) => saw_deny = true,
            }
        }
        match self.policy.combining {
            CombiningAlgorithm::DenyOverrides if saw_allow => Some(Effect::Allow),
            CombiningAlgorithm::AllowOverrides if saw_deny => Some(Effect::Deny),
            _ => None,
        }
    }

    async fn decide(
        &self,
        ctx: &OpContext,
        action: &str,
        object: PermissionObject<'_>,
    ) -> Result<Effect> {
        if self.root_users.contains(&ctx.actor) {
            return Ok(Effect::Allow);
        }

        let candidates = Self::candidate_objects(&object);

        // Iterative BFS over the role graph; the visited set breaks cycles.
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        queue.push_back(ctx.actor.clone());
        visited.insert(ctx.actor.clone());

        while let Some(subject) = queue.pop_front() {
            for candidate in &candidates {
                let rules = self.rules_for(ctx, &subject, *candidate).await?;
                if let Some(effect) = self.decide_candidate(&rules, action) {
                    tracing::debug!(
                        actor = %ctx.actor,
                        subject = %subject,
                        action,
                        candidate = ?candidate,
                        ?effect,
                        "permission decided"
                    );
                    return Ok(effect);
                }
            }
            for group in self.groups_of(ctx, &subject).await? {
                if visited.insert(group.clone()) {
                    queue.push_back(group);
                }
            }
        }

        Ok(self.policy.default_effect)
    }
}

#[async_trait]
impl PermissionGate for PermissionEngine {
    async fn check(
        &self,
        ctx: &OpContext,
        action: &str,
        object: PermissionObject<'_>,
    ) -> Result<Effect> {
        self.decide(ctx, action, object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_presets() {
        let strict = Policy::strict();
        assert_eq!(strict.combining, CombiningAlgorithm::DenyOverrides);
        assert_eq!(strict.default_effect, Effect::Deny);

        let permissive = Policy::permissive();
        assert_eq!(permissive.combining, CombiningAlgorithm::AllowOverrides);
        assert_eq!(permissive.default_effect, Effect::Allow);
    }

    #[test]
    fn acl_record_serde_defaults_effect_to_allow() {
        let rule: AclPermission = serde_json::from_value(serde_json::json!({
            "subject": "user:alice",
            "object": "item",
            "action": "get",
        }))
        .unwrap();
        assert_eq!(rule.effect, Effect::Allow);
        assert_eq!(rule.order, None);
    }
}
