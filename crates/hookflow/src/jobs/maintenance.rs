use chrono::{DateTime, Utc};
use std::time::Duration;

/// How many terminal jobs each queue keeps. Older ones are pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub keep_completed: i64,
    pub keep_failed: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

pub fn cutoff(now: DateTime<Utc>, older_than: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
