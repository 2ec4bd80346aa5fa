//! Reorder engine: user-initiated moves inside one list.

use tracing::{debug, instrument};
use vrank_core::{ItemId, ItemKind, ListKey, RankEntry, RankResult, UserId};
use vrank_storage::{RankList, Storage};

use crate::favorites::after_task_move;
use crate::listops;
use crate::Engine;

impl<S: Storage> Engine<S> {
    /// Moves the entry at rank `from` to rank `to`. Both must be occupied
    /// active ranks of the user's list; otherwise `InvalidRank` and nothing
    /// changes. For tasks the favorite flag follows the destination.
    #[instrument(skip_all, fields(user = %user, %kind, from = from, to = to))]
    pub fn move_rank(&self, user: &UserId, kind: ItemKind, from: u32, to: u32) -> RankResult<RankEntry> {
        let key = ListKey::new(user.clone(), kind);
        let capacity = self.config().favorite_capacity;
        let moved = self
            .store()
            .with_list(&key, |list| reorder(list, from, to, capacity))?;
        debug!(item = %moved.item_id, "moved");
        Ok(moved)
    }

    /// Moves `item` to the rank currently held by `target`, as a drag-and-drop
    /// onto another row would.
    #[instrument(skip_all, fields(user = %user, %kind, item = %item, target = %target))]
    pub fn move_item(&self, user: &UserId, kind: ItemKind, item: &ItemId, target: &ItemId) -> RankResult<RankEntry> {
        let key = ListKey::new(user.clone(), kind);
        let capacity = self.config().favorite_capacity;
        self.store().with_list(&key, |list| {
            let from = listops::active_rank(list, item)?;
            let to = listops::active_rank(list, target)?;
            reorder(list, from, to, capacity)
        })
    }
}

fn reorder(list: &mut dyn RankList, from: u32, to: u32, capacity: usize) -> RankResult<RankEntry> {
    let max_before = list.max_favorite_rank()?;
    let moved = listops::move_rank(list, from, to)?;
    if from != to && list.key().kind == ItemKind::Task {
        let before = RankEntry { rank: from, ..moved.clone() };
        after_task_move(list, &before, to, max_before, capacity)?;
    }
    list.get(&moved.item_id)
        .map(|e| e.unwrap_or(moved))
}
