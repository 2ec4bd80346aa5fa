pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stable per-process worker identity used for job leases.
pub fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}
