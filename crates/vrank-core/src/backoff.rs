/// Retry delay for a background reconciliation batch.
///
/// Attempt 1: immediate (0s)
/// Attempt 2: 5s
/// Attempt 3: 30s
/// Attempt 4+: 5m (caller dead-letters after max_attempts)
pub fn reconcile_backoff_seconds(attempt_number: u32) -> u64 {
    match attempt_number {
        0 | 1 => 0,
        2 => 5,
        3 => 30,
        _ => 5 * 60,
    }
}
