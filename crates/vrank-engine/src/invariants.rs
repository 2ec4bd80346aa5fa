//! Consistency checks over stored lists, used by `vrank check`, scenario
//! replays and property tests.

use std::fmt;

use serde::Serialize;
use vrank_core::{ItemKind, ListKey, RankEntry, RankResult};
use vrank_storage::RankStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub list: ListKey,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.list, self.message)
    }
}

/// Checks one list's entries: dense active ranks, favorites only on active
/// tasks, favorites forming a prefix, and the favorite cap.
pub fn check_list(key: &ListKey, entries: &[RankEntry], favorite_capacity: usize) -> Vec<Violation> {
    let mut out = Vec::new();
    let mut report = |message: String| {
        out.push(Violation {
            list: key.clone(),
            message,
        })
    };

    let mut active: Vec<&RankEntry> = entries.iter().filter(|e| !e.is_pinned()).collect();
    active.sort_by_key(|e| e.rank);
    for (i, e) in active.iter().enumerate() {
        let expected = i as u32 + 1;
        if e.rank != expected {
            report(format!("rank {} at position {expected} (item {})", e.rank, e.item_id));
            break;
        }
    }

    for e in entries.iter().filter(|e| e.is_favorite) {
        if e.is_pinned() {
            report(format!("pinned item {} is a favorite", e.item_id));
        } else if key.kind != ItemKind::Task {
            report(format!("{} item {} is a favorite", key.kind, e.item_id));
        }
    }

    let favorites = active.iter().filter(|e| e.is_favorite).count();
    if let Some(gap) = active.iter().take(favorites).find(|e| !e.is_favorite) {
        report(format!("non-favorite {} inside the favorite block", gap.item_id));
    }
    if favorites > favorite_capacity {
        report(format!("{favorites} favorites over the cap of {favorite_capacity}"));
    }
    out
}

pub fn check_store<R: RankStore + ?Sized>(store: &R, favorite_capacity: usize) -> RankResult<Vec<Violation>> {
    let mut out = Vec::new();
    for key in store.list_keys()? {
        let entries = store.entries(&key)?;
        out.extend(check_list(&key, &entries, favorite_capacity));
    }
    Ok(out)
}
