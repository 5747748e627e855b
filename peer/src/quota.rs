//! Quota ledger: sliding-window task admission plus cumulative key and
//! storage-byte counters.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use weft_protocol::ErrorKind;

pub const DEFAULT_MAX_CPU_TASKS: usize = 100;
pub const DEFAULT_MAX_MEMORY_KEYS: usize = 1000;
pub const DEFAULT_MAX_STORAGE_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_WINDOW_SECS: u64 = 3600;

pub struct QuotaLedger {
    max_cpu_tasks: usize,
    max_memory_keys: usize,
    max_storage_bytes: u64,
    window: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    submissions: VecDeque<Instant>,
    storage_bytes: u64,
}

impl QuotaLedger {
    pub fn new(max_cpu_tasks: usize, max_memory_keys: usize, max_storage_bytes: u64, window: Duration) -> Self {
        Self {
            max_cpu_tasks,
            max_memory_keys,
            max_storage_bytes,
            window,
            inner: Mutex::new(Inner { submissions: VecDeque::new(), storage_bytes: 0 }),
        }
    }

    /// Admit one CPU submission, counting it against the sliding window.
    pub fn admit_task(&self) -> Result<(), (ErrorKind, String)> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        while let Some(front) = inner.submissions.front() {
            if now.duration_since(*front) >= self.window {
                inner.submissions.pop_front();
            } else {
                break;
            }
        }
        if inner.submissions.len() >= self.max_cpu_tasks {
            return Err((
                ErrorKind::QuotaExceeded,
                format!(
                    "CPU task quota exceeded ({} per {}s)",
                    self.max_cpu_tasks,
                    self.window.as_secs()
                ),
            ));
        }
        inner.submissions.push_back(now);
        Ok(())
    }

    /// Check the key counter against the limit for one more key.
    pub fn admit_key(&self, current_keys: usize) -> Result<(), (ErrorKind, String)> {
        if current_keys >= self.max_memory_keys {
            return Err((
                ErrorKind::QuotaExceeded,
                format!("memory quota exceeded (max {} keys)", self.max_memory_keys),
            ));
        }
        Ok(())
    }

    /// Charge `bytes` against the storage budget.
    pub fn charge_storage(&self, bytes: u64) -> Result<(), (ErrorKind, String)> {
        let mut inner = self.inner.lock().unwrap();
        let new_total = inner.storage_bytes.saturating_add(bytes);
        if new_total > self.max_storage_bytes {
            return Err((
                ErrorKind::QuotaExceeded,
                format!("storage quota exceeded (max {} bytes)", self.max_storage_bytes),
            ));
        }
        inner.storage_bytes = new_total;
        Ok(())
    }

    pub fn release_storage(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.storage_bytes = inner.storage_bytes.saturating_sub(bytes);
    }

    pub fn usage(&self) -> Value {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let recent = inner
            .submissions
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count();
        serde_json::json!({
            "cpu_tasks": {
                "used": recent,
                "limit": self.max_cpu_tasks,
                "window_seconds": self.window.as_secs(),
            },
            "memory_keys": { "limit": self.max_memory_keys },
            "storage": {
                "used_bytes": inner.storage_bytes,
                "limit_bytes": self.max_storage_bytes,
            },
        })
    }
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_CPU_TASKS,
            DEFAULT_MAX_MEMORY_KEYS,
            DEFAULT_MAX_STORAGE_BYTES,
            Duration::from_secs(DEFAULT_WINDOW_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_limits_submissions() {
        let quota = QuotaLedger::new(3, 10, 1024, Duration::from_secs(3600));
        for _ in 0..3 {
            quota.admit_task().unwrap();
        }
        let (kind, _) = quota.admit_task().unwrap_err();
        assert_eq!(kind, ErrorKind::QuotaExceeded);
    }

    #[test]
    fn expired_submissions_leave_the_window() {
        let quota = QuotaLedger::new(1, 10, 1024, Duration::from_millis(0));
        quota.admit_task().unwrap();
        // Zero-length window: the first entry is already stale.
        quota.admit_task().unwrap();
    }

    #[test]
    fn storage_charges_and_releases() {
        let quota = QuotaLedger::new(10, 10, 100, Duration::from_secs(1));
        quota.charge_storage(60).unwrap();
        assert!(quota.charge_storage(50).is_err());
        quota.release_storage(30);
        quota.charge_storage(50).unwrap();
        assert_eq!(quota.usage()["storage"]["used_bytes"], 80);
    }

    #[test]
    fn key_limit_is_enforced() {
        let quota = QuotaLedger::new(10, 2, 100, Duration::from_secs(1));
        quota.admit_key(0).unwrap();
        quota.admit_key(1).unwrap();
        assert!(quota.admit_key(2).is_err());
    }
}
