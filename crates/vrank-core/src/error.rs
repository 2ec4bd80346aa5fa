use thiserror::Error;

use crate::{ids::*, model::*, types::*};

#[derive(Debug, Error)]
pub enum RankError {
    /// The caller referenced a rank or item that is not in the user's list.
    #[error("invalid rank for {user_id}/{kind}: {reason}")]
    InvalidRank {
        user_id: UserId,
        kind: ItemKind,
        reason: String,
    },

    #[error("favorite capacity of {limit} reached for {user_id}")]
    CapacityExceeded { user_id: UserId, limit: usize },

    /// A second entry for the same (user, item). Always a caller bug.
    #[error("duplicate rank entry for {user_id} on {item}")]
    DuplicateEntry { user_id: UserId, item: ItemRef },

    /// The item or group changed between the eligibility read and the write.
    #[error("eligibility race on {item}: {reason}")]
    EligibilityRace { item: ItemRef, reason: String },

    #[error("storage backend: {0}")]
    Backend(#[from] anyhow::Error),
}

impl RankError {
    pub fn invalid_rank(key: &ListKey, reason: impl Into<String>) -> Self {
        RankError::InvalidRank {
            user_id: key.user_id.clone(),
            kind: key.kind,
            reason: reason.into(),
        }
    }

    pub fn race(item: &ItemRef, reason: impl Into<String>) -> Self {
        RankError::EligibilityRace {
            item: item.clone(),
            reason: reason.into(),
        }
    }

    /// Stable snake_case name of the variant, for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            RankError::InvalidRank { .. } => "invalid_rank",
            RankError::CapacityExceeded { .. } => "capacity_exceeded",
            RankError::DuplicateEntry { .. } => "duplicate_entry",
            RankError::EligibilityRace { .. } => "eligibility_race",
            RankError::Backend(_) => "backend",
        }
    }

    /// Races and backend hiccups can succeed on a fresh attempt; everything
    /// else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RankError::EligibilityRace { .. } | RankError::Backend(_))
    }
}

pub type RankResult<T> = std::result::Result<T, RankError>;
