//! Process table: pids, parent/child tree, process groups, lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Terminated,
    Zombie,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: String,
    pub ppid: Option<String>,
    pub state: ProcessState,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub cpu_time: f64,
    pub children: Vec<String>,
    pub group_id: Option<String>,
    pub task: Value,
}

pub struct ProcessTable {
    inner: Mutex<Inner>,
}

struct Inner {
    processes: HashMap<String, ProcessInfo>,
    groups: HashMap<String, HashSet<String>>,
    next_pid: u64,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                processes: HashMap::new(),
                groups: HashMap::new(),
                next_pid: 1,
            }),
        }
    }

    pub fn create(&self, task: Value, parent: Option<String>, group: Option<String>) -> String {
        let mut inner = self.inner.lock().unwrap();
        let pid = format!("P{}", inner.next_pid);
        inner.next_pid += 1;

        let priority = task.get("priority").and_then(Value::as_i64).unwrap_or(0);
        let info = ProcessInfo {
            pid: pid.clone(),
            ppid: parent.clone(),
            state: ProcessState::New,
            priority,
            created_at: Utc::now(),
            cpu_time: 0.0,
            children: Vec::new(),
            group_id: group.clone(),
            task,
        };
        inner.processes.insert(pid.clone(), info);

        if let Some(parent_pid) = parent {
            if let Some(parent_info) = inner.processes.get_mut(&parent_pid) {
                parent_info.children.push(pid.clone());
            }
        }
        if let Some(group_id) = group {
            inner.groups.entry(group_id).or_default().insert(pid.clone());
        }
        tracing::debug!(pid = %pid, "process created");
        pid
    }

    pub fn set_state(&self, pid: &str, state: ProcessState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.processes.get_mut(pid) {
            Some(info) => {
                info.state = state;
                true
            }
            None => false,
        }
    }

    pub fn add_cpu_time(&self, pid: &str, seconds: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.processes.get_mut(pid) {
            info.cpu_time += seconds;
        }
    }

    pub fn contains(&self, pid: &str) -> bool {
        self.inner.lock().unwrap().processes.contains_key(pid)
    }

    /// Post-order termination: every descendant transitions to TERMINATED
    /// before the process itself. Returns false for unknown pids.
    pub fn terminate(&self, pid: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.processes.contains_key(pid) {
            return false;
        }
        Self::terminate_subtree(&mut inner, pid);
        tracing::debug!(pid, "process terminated");
        true
    }

    fn terminate_subtree(inner: &mut Inner, pid: &str) {
        let children = inner
            .processes
            .get(pid)
            .map(|p| p.children.clone())
            .unwrap_or_default();
        for child in children {
            Self::terminate_subtree(inner, &child);
        }
        let info = match inner.processes.get_mut(pid) {
            Some(info) => {
                info.state = ProcessState::Terminated;
                info.clone()
            }
            None => return,
        };
        if let Some(ppid) = &info.ppid {
            if let Some(parent) = inner.processes.get_mut(ppid) {
                parent.children.retain(|c| c != pid);
            }
        }
        if let Some(group_id) = &info.group_id {
            if let Some(group) = inner.groups.get_mut(group_id) {
                group.remove(pid);
            }
        }
        inner.processes.remove(pid);
    }

    pub fn create_group(&self, group_id: &str, pids: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        let mut added = HashSet::new();
        for pid in pids {
            if inner.processes.contains_key(pid) {
                added.insert(pid.clone());
            }
        }
        for pid in &added {
            if let Some(info) = inner.processes.get_mut(pid) {
                info.group_id = Some(group_id.to_string());
            }
        }
        inner.groups.entry(group_id.to_string()).or_default().extend(added);
    }

    /// Terminate every member of a group; returns the number terminated.
    pub fn kill_group(&self, group_id: &str) -> usize {
        let members: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.groups.get(group_id).map(|g| g.iter().cloned().collect()).unwrap_or_default()
        };
        let mut count = 0;
        for pid in members {
            if self.terminate(&pid) {
                count += 1;
            }
        }
        self.inner.lock().unwrap().groups.remove(group_id);
        count
    }

    pub fn tree(&self, root: Option<&str>) -> Value {
        let inner = self.inner.lock().unwrap();
        match root {
            Some(pid) => Self::build_tree(&inner, pid).unwrap_or(Value::Null),
            None => {
                let mut roots: Vec<&ProcessInfo> =
                    inner.processes.values().filter(|p| p.ppid.is_none()).collect();
                roots.sort_by(|a, b| a.pid.cmp(&b.pid));
                serde_json::json!({
                    "roots": roots
                        .iter()
                        .filter_map(|p| Self::build_tree(&inner, &p.pid))
                        .collect::<Vec<_>>(),
                    "total_processes": inner.processes.len(),
                })
            }
        }
    }

    fn build_tree(inner: &Inner, pid: &str) -> Option<Value> {
        let info = inner.processes.get(pid)?;
        let children: Vec<Value> = info
            .children
            .iter()
            .filter_map(|c| Self::build_tree(inner, c))
            .collect();
        Some(serde_json::json!({
            "pid": info.pid,
            "ppid": info.ppid,
            "state": info.state,
            "priority": info.priority,
            "children": children,
        }))
    }

    pub fn statistics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut total_cpu_time = 0.0f64;
        for info in inner.processes.values() {
            let key = serde_json::to_value(info.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *by_state.entry(key).or_default() += 1;
            total_cpu_time += info.cpu_time;
        }
        serde_json::json!({
            "total_processes": inner.processes.len(),
            "process_groups": inner.groups.len(),
            "processes_by_state": by_state,
            "total_cpu_time": total_cpu_time,
        })
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pids_are_sequential() {
        let table = ProcessTable::new();
        assert_eq!(table.create(json!({}), None, None), "P1");
        assert_eq!(table.create(json!({}), None, None), "P2");
    }

    #[test]
    fn terminate_cascades_post_order() {
        let table = ProcessTable::new();
        let root = table.create(json!({}), None, None);
        let child = table.create(json!({}), Some(root.clone()), None);
        let grandchild = table.create(json!({}), Some(child.clone()), None);

        assert!(table.terminate(&root));
        assert!(!table.contains(&root));
        assert!(!table.contains(&child));
        assert!(!table.contains(&grandchild));
        assert!(!table.terminate(&root), "already gone");
    }

    #[test]
    fn kill_group_terminates_members_only() {
        let table = ProcessTable::new();
        let a = table.create(json!({}), None, Some("g1".into()));
        let b = table.create(json!({}), None, Some("g1".into()));
        let loner = table.create(json!({}), None, None);

        assert_eq!(table.kill_group("g1"), 2);
        assert!(!table.contains(&a));
        assert!(!table.contains(&b));
        assert!(table.contains(&loner));
        assert_eq!(table.kill_group("g1"), 0);
    }

    #[test]
    fn tree_reflects_parentage() {
        let table = ProcessTable::new();
        let root = table.create(json!({"priority": 5}), None, None);
        let _child = table.create(json!({}), Some(root.clone()), None);

        let tree = table.tree(Some(&root));
        assert_eq!(tree["pid"], "P1");
        assert_eq!(tree["priority"], 5);
        assert_eq!(tree["children"][0]["pid"], "P2");

        let all = table.tree(None);
        assert_eq!(all["total_processes"], 2);
        assert_eq!(all["roots"][0]["pid"], "P1");
    }
}
