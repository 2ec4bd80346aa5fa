use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*};

/// Identifies an item across kinds; item ids are only unique within a kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub id: ItemId,
}

impl ItemRef {
    pub fn new(kind: ItemKind, id: ItemId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A task, project or workflow as seen by the ranking engine (read-only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub org_id: OrgId,
    pub status: ItemStatus,
    /// Only meaningful for tasks.
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub assignees: BTreeSet<UserId>,
    #[serde(default)]
    pub groups: BTreeSet<GroupId>,
    pub creator: UserId,
    /// Projects and workflows only.
    #[serde(default)]
    pub owner: Option<UserId>,
}

impl WorkItem {
    pub fn kind(&self) -> ItemKind {
        self.status.kind()
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.kind(), self.id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub org_id: OrgId,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub group_id: GroupId,
    pub slug: Slug,
    pub has_permission: bool,
}

/// Identifies one user's ranked list for one kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListKey {
    pub user_id: UserId,
    pub kind: ItemKind,
}

impl ListKey {
    pub fn new(user_id: UserId, kind: ItemKind) -> Self {
        Self { user_id, kind }
    }
}

impl fmt::Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.kind)
    }
}

/// One row of a user's ranked list. `rank == 0` is the pinned bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub kind: ItemKind,
    pub rank: u32,
    #[serde(default)]
    pub is_favorite: bool,
}

impl RankEntry {
    pub fn new(key: &ListKey, item_id: ItemId, rank: u32) -> Self {
        Self {
            user_id: key.user_id.clone(),
            item_id,
            kind: key.kind,
            rank,
            is_favorite: false,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.rank == 0
    }

    pub fn key(&self) -> ListKey {
        ListKey::new(self.user_id.clone(), self.kind)
    }
}

/// Why a background reconciliation job was planned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum JobScope {
    /// A grant on this group was toggled; every item of the kind is in scope.
    Grant { group_id: GroupId },
    /// Membership in this group changed; every item of the kind is in scope.
    Membership { group_id: GroupId },
}

impl JobScope {
    pub fn group_id(&self) -> &GroupId {
        match self {
            JobScope::Grant { group_id } | JobScope::Membership { group_id } => group_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobScope::Grant { .. } => "grant",
            JobScope::Membership { .. } => "membership",
        }
    }
}

/// A batch of users whose lists for `kind` must be re-derived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileJob {
    pub id: JobId,
    pub org_id: OrgId,
    pub kind: ItemKind,
    pub scope: JobScope,
    pub users: Vec<UserId>,
    pub visible_at_unix: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub idempotency_key: String,
    #[serde(default)]
    pub last_error: Option<String>,
}
