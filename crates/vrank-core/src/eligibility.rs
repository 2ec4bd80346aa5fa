//! Eligibility resolver: which users may see which items.
//!
//! Pure functions over an [`OrgSnapshot`]; nothing here touches storage.

use std::collections::BTreeSet;

use crate::{ids::*, model::*, snapshot::OrgSnapshot, types::*};

/// Creator, direct assignee, member of an assigned group, or owner.
pub fn is_tied(snapshot: &OrgSnapshot, user: &UserId, item: &WorkItem) -> bool {
    if &item.creator == user || item.assignees.contains(user) || item.owner.as_ref() == Some(user) {
        return true;
    }
    item.groups
        .iter()
        .filter_map(|g| snapshot.groups.get(g))
        .any(|g| g.members.contains(user))
}

/// Whether the user is entitled to the item, ignoring the archived-visibility
/// caveat. A rank entry exists exactly for entitled users; terminal items sit
/// in the pinned bucket.
pub fn covered(snapshot: &OrgSnapshot, user: &UserId, item: &WorkItem) -> bool {
    if item.org_id != snapshot.org_id || !snapshot.is_member(user) {
        return false;
    }
    let kind = item.kind();
    if snapshot.has_slug(user, Slug::new(kind, Access::ViewAll)) {
        if kind == ItemKind::Task && item.is_private {
            return is_tied(snapshot, user, item);
        }
        return true;
    }
    if snapshot.has_slug(user, Slug::new(kind, Access::View)) {
        return is_tied(snapshot, user, item);
    }
    false
}

/// Whether the user can currently see the item. Terminal items additionally
/// require `<kind>-view-archived`.
pub fn eligible(snapshot: &OrgSnapshot, user: &UserId, item: &WorkItem) -> bool {
    if !covered(snapshot, user, item) {
        return false;
    }
    !item.is_terminal() || snapshot.has_slug(user, Slug::new(item.kind(), Access::ViewArchived))
}

pub fn covered_users(snapshot: &OrgSnapshot, item: &WorkItem) -> BTreeSet<UserId> {
    snapshot.members().into_iter().filter(|u| covered(snapshot, u, item)).collect()
}

pub fn eligible_users(snapshot: &OrgSnapshot, item: &WorkItem) -> BTreeSet<UserId> {
    snapshot.members().into_iter().filter(|u| eligible(snapshot, u, item)).collect()
}
