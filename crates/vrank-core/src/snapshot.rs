use std::collections::{BTreeMap, BTreeSet};

use crate::{ids::*, model::*, types::*};

/// Read-only view of one organisation's authorization facts.
/// The storage shell produces it; the eligibility resolver only reads it.
#[derive(Clone, Debug, Default)]
pub struct OrgSnapshot {
    pub org_id: OrgId,
    pub groups: BTreeMap<GroupId, Group>,
    pub grants: BTreeMap<(GroupId, Slug), bool>,
    pub items: BTreeMap<ItemRef, WorkItem>,
}

impl OrgSnapshot {
    pub fn new(org_id: OrgId) -> Self {
        Self {
            org_id,
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.groups.insert(group.id.clone(), group);
        self
    }

    pub fn with_grant(mut self, group_id: GroupId, slug: Slug, has_permission: bool) -> Self {
        self.grants.insert((group_id, slug), has_permission);
        self
    }

    pub fn with_item(mut self, item: WorkItem) -> Self {
        self.items.insert(item.item_ref(), item);
        self
    }

    /// Every user that belongs to at least one group of the organisation.
    pub fn members(&self) -> BTreeSet<UserId> {
        self.groups.values().flat_map(|g| g.members.iter().cloned()).collect()
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.groups.values().any(|g| g.members.contains(user))
    }

    pub fn groups_of<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a Group> + 'a {
        self.groups.values().filter(move |g| g.members.contains(user))
    }

    /// True if any of the user's groups holds `slug` with `has_permission`.
    pub fn has_slug(&self, user: &UserId, slug: Slug) -> bool {
        self.groups_of(user)
            .any(|g| self.grants.get(&(g.id.clone(), slug)).copied().unwrap_or(false))
    }

    /// Kinds for which the group holds at least one positive grant.
    pub fn granted_kinds(&self, group_id: &GroupId) -> BTreeSet<ItemKind> {
        self.grants
            .iter()
            .filter(|((g, _), has)| g == group_id && **has)
            .map(|((_, slug), _)| slug.kind)
            .collect()
    }

    pub fn items_of_kind(&self, kind: ItemKind) -> impl Iterator<Item = &WorkItem> + '_ {
        self.items.values().filter(move |i| i.kind() == kind)
    }

    pub fn items_assigned_to_group<'a>(&'a self, group_id: &'a GroupId) -> impl Iterator<Item = &'a WorkItem> + 'a {
        self.items.values().filter(move |i| i.groups.contains(group_id))
    }

    pub fn item(&self, item: &ItemRef) -> Option<&WorkItem> {
        self.items.get(item)
    }
}
