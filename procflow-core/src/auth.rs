use crate::types::Actor;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Task-level access control consulted before a task is completed.
#[async_trait]
pub trait AuthorizationCheck: Send + Sync {
    async fn is_authorized(&self, node_id: &str, actor: &Actor) -> Result<bool>;

    /// Task nodes assigned to a user, for work-list queries.
    fn assigned_to_user(&self, _user_id: &str) -> Vec<String> {
        Vec::new()
    }

    /// Task nodes open to a group, for work-list queries.
    fn assigned_to_group(&self, _group: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Authorizes everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthorizationCheck for AllowAll {
    async fn is_authorized(&self, _node_id: &str, _actor: &Actor) -> Result<bool> {
        Ok(true)
    }
}

/// Access rule for one task node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAccessRule {
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub authorized_groups: Vec<String>,
}

impl TaskAccessRule {
    fn is_unconstrained(&self) -> bool {
        self.assignee.is_none()
            && self.required_roles.is_empty()
            && self.authorized_groups.is_empty()
    }

    fn admits(&self, actor: &Actor) -> bool {
        self.is_unconstrained()
            || self.assignee.as_deref() == Some(actor.id.as_str())
            || self.required_roles.iter().any(|r| actor.roles.contains(r))
            || self.authorized_groups.iter().any(|g| actor.groups.contains(g))
    }
}

/// Rule table keyed by node id. Nodes without a rule are open to everyone.
#[derive(Debug, Clone, Default)]
pub struct TaskAccessPolicy {
    rules: HashMap<String, TaskAccessRule>,
}

impl TaskAccessPolicy {
    pub fn new(rules: impl IntoIterator<Item = TaskAccessRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.node.clone(), r)).collect(),
        }
    }

    pub fn rule(&self, node_id: &str) -> Option<&TaskAccessRule> {
        self.rules.get(node_id)
    }

    /// Nodes explicitly assigned to `user_id`.
    pub fn nodes_for_user(&self, user_id: &str) -> Vec<String> {
        self.collect_nodes(|r| r.assignee.as_deref() == Some(user_id))
    }

    /// Nodes open to members of `group`.
    pub fn nodes_for_group(&self, group: &str) -> Vec<String> {
        self.collect_nodes(|r| r.authorized_groups.iter().any(|g| g == group))
    }

    fn collect_nodes(&self, pred: impl Fn(&TaskAccessRule) -> bool) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .rules
            .values()
            .filter(|r| pred(r))
            .map(|r| r.node.clone())
            .collect();
        nodes.sort();
        nodes
    }
}

#[async_trait]
impl AuthorizationCheck for TaskAccessPolicy {
    async fn is_authorized(&self, node_id: &str, actor: &Actor) -> Result<bool> {
        Ok(self.rules.get(node_id).map_or(true, |rule| rule.admits(actor)))
    }

    fn assigned_to_user(&self, user_id: &str) -> Vec<String> {
        self.nodes_for_user(user_id)
    }

    fn assigned_to_group(&self, group: &str) -> Vec<String> {
        self.nodes_for_group(group)
    }
}
