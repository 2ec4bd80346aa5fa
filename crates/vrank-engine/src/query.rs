use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use vrank_core::{eligible, ItemId, ItemKind, ItemRef, ListKey, OrgId, OrgSnapshot, RankEntry, RankResult, UserId};
use vrank_storage::Storage;

use crate::Engine;

impl<S: Storage> Engine<S> {
    /// Item ids in ascending rank. With `include_pinned`, terminal items the
    /// user may still see (those needing view-archived) follow in item-id
    /// order.
    pub fn ranked_list(&self, user: &UserId, kind: ItemKind, include_pinned: bool) -> RankResult<Vec<ItemId>> {
        let entries = self.entries(user, kind)?;
        let mut out: Vec<ItemId> = entries
            .iter()
            .filter(|e| !e.is_pinned())
            .map(|e| e.item_id.clone())
            .collect();
        if !include_pinned {
            return Ok(out);
        }

        let mut snapshots: BTreeMap<OrgId, OrgSnapshot> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.is_pinned()) {
            let Some(item) = self.store().item(&ItemRef::new(kind, entry.item_id.clone()))? else {
                continue;
            };
            let snapshot = match snapshots.entry(item.org_id.clone()) {
                Entry::Occupied(o) => o.into_mut(),
                Entry::Vacant(v) => v.insert(self.store().load_org(&item.org_id)?),
            };
            if eligible(snapshot, user, &item) {
                out.push(entry.item_id.clone());
            }
        }
        Ok(out)
    }

    /// Raw stored entries, active by rank then pinned.
    pub fn entries(&self, user: &UserId, kind: ItemKind) -> RankResult<Vec<RankEntry>> {
        self.store().entries(&ListKey::new(user.clone(), kind))
    }
}
