use vrank_core::{ItemKind, JobId, JobScope, OrgId, RankError, ReconcileJob, UserId};

/// Classification of a batch failure to decide retry vs dead-letter.
/// This stays pure and testable; the worker applies it to the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Item or group changed underneath the batch.
    Race,
    /// Storage or transport error.
    Backend,
    /// Uniqueness violation or bad input; retrying cannot help.
    Fatal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfterSecs(u64),
    DeadLetter { reason: String },
}

pub fn classify(err: &RankError) -> FailureClass {
    match err {
        RankError::EligibilityRace { .. } => FailureClass::Race,
        RankError::Backend(_) => FailureClass::Backend,
        RankError::DuplicateEntry { .. } | RankError::InvalidRank { .. } | RankError::CapacityExceeded { .. } => {
            FailureClass::Fatal
        }
    }
}

/// Retry policy for background batches:
/// - Race: retry immediately once, then back off
/// - Backend: back off
/// - Fatal: dead-letter
///
/// `attempt_number` is 1-based and counts the attempt that just failed.
pub fn decide_retry(class: FailureClass, attempt_number: u32, max_attempts: u32) -> RetryDecision {
    if attempt_number >= max_attempts {
        return RetryDecision::DeadLetter {
            reason: format!("{class:?} failure after {attempt_number} attempts"),
        };
    }
    match class {
        FailureClass::Race => {
            if attempt_number <= 1 {
                RetryDecision::RetryAfterSecs(0)
            } else {
                RetryDecision::RetryAfterSecs(vrank_core::reconcile_backoff_seconds(attempt_number))
            }
        }
        FailureClass::Backend => RetryDecision::RetryAfterSecs(vrank_core::reconcile_backoff_seconds(attempt_number + 1)),
        FailureClass::Fatal => RetryDecision::DeadLetter {
            reason: "non-retryable failure".to_string(),
        },
    }
}

/// Input for [`plan_batches`].
#[derive(Clone, Debug)]
pub struct BatchPlan {
    pub org_id: OrgId,
    pub kind: ItemKind,
    pub scope: JobScope,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub now_unix: i64,
}

/// Splits users into jobs of at most `batch_size`, in user-id order, so each
/// batch can commit and retry on its own.
pub fn plan_batches(plan: &BatchPlan, mut users: Vec<UserId>) -> Vec<ReconcileJob> {
    users.sort();
    users.dedup();
    let size = plan.batch_size.max(1);
    users
        .chunks(size)
        .map(|chunk| ReconcileJob {
            id: JobId::new(),
            org_id: plan.org_id.clone(),
            kind: plan.kind,
            scope: plan.scope.clone(),
            users: chunk.to_vec(),
            visible_at_unix: plan.now_unix,
            attempts: 0,
            max_attempts: plan.max_attempts,
            idempotency_key: idempotency_key(&plan.org_id, plan.kind, &plan.scope, chunk),
            last_error: None,
        })
        .collect()
}

/// Same scope and same users means the same work; a pending duplicate is redundant.
/// Every user id is part of the key, so batches that differ in any member never
/// coalesce.
pub fn idempotency_key(org_id: &OrgId, kind: ItemKind, scope: &JobScope, users: &[UserId]) -> String {
    let mut ids: Vec<&str> = users.iter().map(UserId::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    format!(
        "{}:{}:{}:{}:{}",
        org_id,
        scope.label(),
        scope.group_id(),
        kind,
        ids.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrank_core::{GroupId, ItemId, ItemRef};

    fn plan(batch_size: usize) -> BatchPlan {
        BatchPlan {
            org_id: OrgId::from_str("org"),
            kind: ItemKind::Task,
            scope: JobScope::Grant {
                group_id: GroupId::from_str("g"),
            },
            batch_size,
            max_attempts: 4,
            now_unix: 100,
        }
    }

    fn users(names: &[&str]) -> Vec<UserId> {
        names.iter().map(|n| UserId::from_str(*n)).collect()
    }

    #[test]
    fn race_retries_immediately_first() {
        assert_eq!(decide_retry(FailureClass::Race, 1, 4), RetryDecision::RetryAfterSecs(0));
        assert_eq!(decide_retry(FailureClass::Race, 2, 4), RetryDecision::RetryAfterSecs(5));
    }

    #[test]
    fn backend_backs_off() {
        let d = decide_retry(FailureClass::Backend, 1, 4);
        assert_eq!(d, RetryDecision::RetryAfterSecs(5));
    }

    #[test]
    fn fatal_and_exhausted_dead_letter() {
        assert!(matches!(decide_retry(FailureClass::Fatal, 1, 4), RetryDecision::DeadLetter { .. }));
        assert!(matches!(decide_retry(FailureClass::Backend, 4, 4), RetryDecision::DeadLetter { .. }));
    }

    #[test]
    fn classify_maps_taxonomy() {
        let item = ItemRef::new(ItemKind::Task, ItemId::from_str("t"));
        assert_eq!(classify(&RankError::race(&item, "gone")), FailureClass::Race);
        assert_eq!(
            classify(&RankError::DuplicateEntry {
                user_id: UserId::from_str("a"),
                item
            }),
            FailureClass::Fatal
        );
    }

    #[test]
    fn batches_are_sorted_and_bounded() {
        let jobs = plan_batches(&plan(2), users(&["c", "a", "b", "a", "d", "e"]));
        let batches: Vec<Vec<&str>> = jobs
            .iter()
            .map(|j| j.users.iter().map(UserId::as_str).collect())
            .collect();
        assert_eq!(batches, vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
        assert!(jobs.iter().all(|j| j.visible_at_unix == 100 && j.max_attempts == 4));
    }

    #[test]
    fn identical_batches_share_a_key() {
        let a = plan_batches(&plan(10), users(&["a", "b"]));
        let b = plan_batches(&plan(10), users(&["b", "a"]));
        assert_eq!(a[0].idempotency_key, b[0].idempotency_key);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn batches_differing_in_a_middle_member_have_distinct_keys() {
        let p = plan(10);
        let before = idempotency_key(&p.org_id, p.kind, &p.scope, &users(&["a", "b", "d"]));
        let after = idempotency_key(&p.org_id, p.kind, &p.scope, &users(&["a", "c", "d"]));
        assert_ne!(before, after);
        assert_eq!(after, idempotency_key(&p.org_id, p.kind, &p.scope, &users(&["d", "a", "c"])));
    }

    #[test]
    fn empty_member_list_plans_nothing() {
        assert!(plan_batches(&plan(10), vec![]).is_empty());
    }
}
