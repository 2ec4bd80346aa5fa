use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*, types::*};

/// Mutations pushed by the request layer after it has persisted them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ItemCreated {
        item: WorkItem,
    },
    ItemStatusChanged {
        item: WorkItem,
        old: ItemStatus,
        new: ItemStatus,
    },
    ItemAssignmentChanged {
        item: WorkItem,
        #[serde(default)]
        old_assignees: BTreeSet<UserId>,
        #[serde(default)]
        new_assignees: BTreeSet<UserId>,
    },
    GroupMembershipChanged {
        org_id: OrgId,
        group_id: GroupId,
        user_id: UserId,
        change: MembershipChange,
    },
    PermissionGrantChanged {
        org_id: OrgId,
        group_id: GroupId,
        slug: Slug,
        has_permission: bool,
    },
}

impl Event {
    pub fn org_id(&self) -> &OrgId {
        match self {
            Event::ItemCreated { item }
            | Event::ItemStatusChanged { item, .. }
            | Event::ItemAssignmentChanged { item, .. } => &item.org_id,
            Event::GroupMembershipChanged { org_id, .. } | Event::PermissionGrantChanged { org_id, .. } => org_id,
        }
    }
}

/// What caused a reconciliation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    StatusChanged,
    AssignmentChanged,
    GroupMembershipChanged,
    PermissionGrantChanged,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::StatusChanged => "status_changed",
            Trigger::AssignmentChanged => "assignment_changed",
            Trigger::GroupMembershipChanged => "group_membership_changed",
            Trigger::PermissionGrantChanged => "permission_grant_changed",
        };
        f.write_str(s)
    }
}
