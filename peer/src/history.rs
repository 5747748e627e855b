//! Bounded execution log. One record per completed task, statistics computed
//! on demand from the retained buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_protocol::TaskStatus;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Which side of a task this peer was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Executor,
    Requester,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Truncated preview of the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub cached: bool,
}

impl HistoryEntry {
    pub fn new(task_id: impl Into<String>, status: TaskStatus, role: Role) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: "CPU_TASK".to_string(),
            status,
            role,
            timestamp: Utc::now(),
            execution_time: None,
            executed_by: None,
            requested_by: None,
            error: None,
            result: None,
            cached: false,
        }
    }

    pub fn with_result(mut self, result: &Value) -> Self {
        let text = result.to_string();
        self.result = Some(text.chars().take(100).collect());
        self
    }
}

pub struct TaskHistory {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    buffer: VecDeque<HistoryEntry>,
    by_id: HashMap<String, HistoryEntry>,
}

impl TaskHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { buffer: VecDeque::new(), by_id: HashMap::new() }),
            capacity,
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        let mut inner = self.inner.lock().unwrap();
        if inner.buffer.len() == self.capacity {
            if let Some(evicted) = inner.buffer.pop_front() {
                // Keep the lookup map in step with the ring.
                if inner.by_id.get(&evicted.task_id).map(|e| e.timestamp) == Some(evicted.timestamp) {
                    inner.by_id.remove(&evicted.task_id);
                }
            }
        }
        inner.by_id.insert(entry.task_id.clone(), entry.clone());
        inner.buffer.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let inner = self.inner.lock().unwrap();
        inner.buffer.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn find(&self, task_id: &str) -> Option<HistoryEntry> {
        self.inner.lock().unwrap().by_id.get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn statistics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let total = inner.buffer.len();
        if total == 0 {
            return serde_json::json!({
                "total_tasks": 0,
                "successful": 0,
                "failed": 0,
                "cancelled": 0,
                "timed_out": 0,
                "success_rate": 0.0,
                "average_execution_time": 0.0,
            });
        }
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut cancelled = 0usize;
        let mut timed_out = 0usize;
        let mut exec_sum = 0.0f64;
        let mut exec_count = 0usize;
        for entry in &inner.buffer {
            match entry.status {
                TaskStatus::Completed => successful += 1,
                TaskStatus::Failed => failed += 1,
                TaskStatus::Cancelled => cancelled += 1,
                TaskStatus::TimedOut => timed_out += 1,
                TaskStatus::Queued | TaskStatus::Running => {}
            }
            if let Some(t) = entry.execution_time {
                exec_sum += t;
                exec_count += 1;
            }
        }
        serde_json::json!({
            "total_tasks": total,
            "successful": successful,
            "failed": failed,
            "cancelled": cancelled,
            "timed_out": timed_out,
            "success_rate": successful as f64 / total as f64,
            "average_execution_time": if exec_count > 0 { exec_sum / exec_count as f64 } else { 0.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, status: TaskStatus, exec: Option<f64>) -> HistoryEntry {
        let mut e = HistoryEntry::new(id, status, Role::Executor);
        e.execution_time = exec;
        e
    }

    #[test]
    fn buffer_is_bounded() {
        let history = TaskHistory::new(3);
        for i in 0..5 {
            history.record(entry(&format!("t{i}"), TaskStatus::Completed, None));
        }
        assert_eq!(history.len(), 3);
        let recent = history.recent(10);
        assert_eq!(recent[0].task_id, "t2");
        assert_eq!(recent[2].task_id, "t4");
        assert!(history.find("t0").is_none());
        assert!(history.find("t4").is_some());
    }

    #[test]
    fn statistics_match_retained_buffer() {
        let history = TaskHistory::new(100);
        history.record(entry("a", TaskStatus::Completed, Some(2.0)));
        history.record(entry("b", TaskStatus::Completed, Some(4.0)));
        history.record(entry("c", TaskStatus::Failed, None));
        history.record(entry("d", TaskStatus::Cancelled, None));
        let stats = history.statistics();
        assert_eq!(stats["total_tasks"], 4);
        assert_eq!(stats["successful"], 2);
        assert_eq!(stats["failed"], 1);
        assert_eq!(stats["cancelled"], 1);
        assert_eq!(stats["success_rate"], 0.5);
        assert_eq!(stats["average_execution_time"], 3.0);
    }

    #[test]
    fn result_preview_is_truncated() {
        let long = serde_json::json!("y".repeat(500));
        let e = HistoryEntry::new("t", TaskStatus::Completed, Role::Executor).with_result(&long);
        assert_eq!(e.result.unwrap().chars().count(), 100);
    }
}
