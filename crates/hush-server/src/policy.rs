//! Organization membership gate consulted by the sharing engine.
//!
//! Authorization here is binary: an actor either holds standing in an
//! organization or it does not. Role evaluation belongs to the upstream
//! identity system.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::error::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    Identity,
    Service,
}

impl ActorType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "identity" => Some(Self::Identity),
            "service" => Some(Self::Service),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Identity => "identity",
            Self::Service => "service",
        }
    }
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is calling, as asserted by the upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub actor: ActorType,
    pub actor_id: String,
    /// Organization the operation targets.
    pub org_id: String,
    pub actor_auth_method: Option<String>,
    /// Organization the actor's session was issued for.
    pub actor_org_id: Option<String>,
}

/// Proof that an actor holds standing in an organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgPermission {
    pub org_id: String,
    pub actor_id: String,
}

pub trait PermissionService: Send + Sync {
    /// `Ok(None)` means the actor has no standing in `org_id`.
    fn get_org_permission(
        &self,
        actor: ActorType,
        actor_id: &str,
        org_id: &str,
        actor_auth_method: Option<&str>,
        actor_org_id: Option<&str>,
    ) -> Result<Option<OrgPermission>, PolicyError>;
}

/// Static organization → members table, loaded from JSON:
/// `{"org-id": ["user-a", "user-b"]}`.
#[derive(Debug, Clone, Default)]
pub struct MembershipGate {
    members: HashMap<String, HashSet<String>>,
}

impl MembershipGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let members: HashMap<String, HashSet<String>> = serde_json::from_str(json)?;
        Ok(Self { members })
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;
        let gate = Self::from_json(&content)?;
        debug!(
            path = %path.display(),
            orgs = gate.members.len(),
            "loaded organization memberships"
        );
        Ok(gate)
    }

    pub fn with_member(mut self, org_id: &str, actor_id: &str) -> Self {
        self.members
            .entry(org_id.to_owned())
            .or_default()
            .insert(actor_id.to_owned());
        self
    }

    fn is_member(&self, org_id: &str, actor_id: &str) -> bool {
        self.members
            .get(org_id)
            .is_some_and(|ids| ids.contains(actor_id))
    }
}

impl PermissionService for MembershipGate {
    fn get_org_permission(
        &self,
        actor: ActorType,
        actor_id: &str,
        org_id: &str,
        _actor_auth_method: Option<&str>,
        actor_org_id: Option<&str>,
    ) -> Result<Option<OrgPermission>, PolicyError> {
        if actor == ActorType::Service {
            return Ok(None);
        }
        // A session scoped to another organization carries no standing here.
        if actor_org_id.is_some_and(|scoped| scoped != org_id) {
            return Ok(None);
        }
        if !self.is_member(org_id, actor_id) {
            return Ok(None);
        }
        Ok(Some(OrgPermission {
            org_id: org_id.to_owned(),
            actor_id: actor_id.to_owned(),
        }))
    }
}
