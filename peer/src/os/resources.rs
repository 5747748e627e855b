//! Resource arbitration: banker's-algorithm safety check on every grant and
//! wait-for-graph cycle detection for deadlock reports.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value;

use weft_protocol::ErrorKind;

#[derive(Debug, Clone)]
struct Resource {
    kind: String,
    total: u64,
    available: u64,
    /// pid → units currently held
    allocated: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct Claim {
    /// resource → units held
    allocation: HashMap<String, u64>,
    max_need: HashMap<String, u64>,
    /// resource → units still claimable (max_need − allocation)
    need: HashMap<String, u64>,
}

pub struct ResourceArbiter {
    inner: Mutex<Inner>,
}

struct Inner {
    resources: HashMap<String, Resource>,
    processes: HashMap<String, Claim>,
}

impl ResourceArbiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { resources: HashMap::new(), processes: HashMap::new() }),
        }
    }

    pub fn register_resource(&self, name: &str, kind: &str, total: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.resources.insert(
            name.to_string(),
            Resource {
                kind: kind.to_string(),
                total,
                available: total,
                allocated: HashMap::new(),
            },
        );
        tracing::info!(resource = name, units = total, "resource registered");
    }

    pub fn register_process(&self, pid: &str, max_need: HashMap<String, u64>) {
        let mut inner = self.inner.lock().unwrap();
        let allocation: HashMap<String, u64> = max_need.keys().map(|r| (r.clone(), 0)).collect();
        let need = max_need.clone();
        inner.processes.insert(pid.to_string(), Claim { allocation, max_need, need });
    }

    pub fn is_registered(&self, pid: &str) -> bool {
        self.inner.lock().unwrap().processes.contains_key(pid)
    }

    /// Drop a process's claims and return everything it holds to the pool.
    pub fn retire_process(&self, pid: &str) {
        let mut inner = self.inner.lock().unwrap();
        let claim = match inner.processes.remove(pid) {
            Some(c) => c,
            None => return,
        };
        for (resource_name, held) in claim.allocation {
            if held == 0 {
                continue;
            }
            if let Some(resource) = inner.resources.get_mut(&resource_name) {
                resource.available += held;
                resource.allocated.remove(pid);
            }
        }
    }

    /// Grant `units` of `resource` to `pid` if the resulting state is safe.
    pub fn request(&self, pid: &str, resource_name: &str, units: u64) -> Result<(), (ErrorKind, String)> {
        if units == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.processes.contains_key(pid) {
            return Err((ErrorKind::UnknownPid, format!("process {pid} not registered")));
        }
        if !inner.resources.contains_key(resource_name) {
            return Err((ErrorKind::UnknownResource, format!("resource {resource_name} not registered")));
        }

        let need = inner.processes[pid].need.get(resource_name).copied().unwrap_or(0);
        if units > need {
            return Err((
                ErrorKind::ExceedsNeed,
                format!("{pid} requested {units} of {resource_name} but needs only {need}"),
            ));
        }
        let available = inner.resources[resource_name].available;
        if units > available {
            return Err((
                ErrorKind::ExceedsAvailable,
                format!("{units} of {resource_name} requested, {available} available"),
            ));
        }

        Self::apply(&mut inner, pid, resource_name, units as i64);
        if Self::is_safe(&inner) {
            tracing::info!(pid, resource = resource_name, units, "resource granted");
            Ok(())
        } else {
            Self::apply(&mut inner, pid, resource_name, -(units as i64));
            tracing::warn!(pid, resource = resource_name, units, "resource denied, unsafe state");
            Err((
                ErrorKind::Unsafe,
                format!("granting {units} of {resource_name} to {pid} would leave no safe ordering"),
            ))
        }
    }

    pub fn release(&self, pid: &str, resource_name: &str, units: u64) -> Result<(), (ErrorKind, String)> {
        if units == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.processes.contains_key(pid) {
            return Err((ErrorKind::UnknownPid, format!("process {pid} not registered")));
        }
        if !inner.resources.contains_key(resource_name) {
            return Err((ErrorKind::UnknownResource, format!("resource {resource_name} not registered")));
        }
        let held = inner.processes[pid].allocation.get(resource_name).copied().unwrap_or(0);
        if units > held {
            return Err((
                ErrorKind::BadRequest,
                format!("{pid} holds {held} of {resource_name}, cannot release {units}"),
            ));
        }
        Self::apply(&mut inner, pid, resource_name, -(units as i64));
        tracing::info!(pid, resource = resource_name, units, "resource released");
        Ok(())
    }

    /// Apply a signed allocation delta to both tables.
    fn apply(inner: &mut Inner, pid: &str, resource_name: &str, delta: i64) {
        let resource = inner.resources.get_mut(resource_name).unwrap();
        let claim = inner.processes.get_mut(pid).unwrap();
        if delta >= 0 {
            let units = delta as u64;
            resource.available -= units;
            *resource.allocated.entry(pid.to_string()).or_insert(0) += units;
            *claim.allocation.entry(resource_name.to_string()).or_insert(0) += units;
            *claim.need.entry(resource_name.to_string()).or_insert(0) -= units;
        } else {
            let units = (-delta) as u64;
            resource.available += units;
            if let Some(held) = resource.allocated.get_mut(pid) {
                *held -= units;
                if *held == 0 {
                    resource.allocated.remove(pid);
                }
            }
            *claim.allocation.entry(resource_name.to_string()).or_insert(0) -= units;
            *claim.need.entry(resource_name.to_string()).or_insert(0) += units;
        }
    }

    /// Banker's safety check: some ordering must let every process acquire
    /// its remaining need from the then-available pool.
    fn is_safe(inner: &Inner) -> bool {
        let mut work: HashMap<&str, u64> =
            inner.resources.iter().map(|(name, r)| (name.as_str(), r.available)).collect();
        let mut finished: HashSet<&str> = HashSet::new();

        loop {
            let mut advanced = false;
            for (pid, claim) in &inner.processes {
                if finished.contains(pid.as_str()) {
                    continue;
                }
                let can_finish = claim
                    .need
                    .iter()
                    .all(|(resource, need)| *need <= work.get(resource.as_str()).copied().unwrap_or(0));
                if can_finish {
                    for (resource, held) in &claim.allocation {
                        if let Some(w) = work.get_mut(resource.as_str()) {
                            *w += held;
                        }
                    }
                    finished.insert(pid);
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
        }
        finished.len() == inner.processes.len()
    }

    /// Build the wait-for graph and report the members of any cycle.
    pub fn detect_deadlock(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut graph: HashMap<&str, HashSet<&str>> = HashMap::new();
        for (pid, claim) in &inner.processes {
            let edges = graph.entry(pid.as_str()).or_default();
            for (resource_name, need) in &claim.need {
                if *need == 0 {
                    continue;
                }
                if let Some(resource) = inner.resources.get(resource_name) {
                    // Only satisfiable by units some holder gives back.
                    if *need <= resource.available {
                        continue;
                    }
                    for (holder, held) in &resource.allocated {
                        if *held > 0 && holder != pid {
                            edges.insert(holder.as_str());
                        }
                    }
                }
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut deadlocked: HashSet<&str> = HashSet::new();
        for &pid in graph.keys() {
            if !visited.contains(pid) {
                let mut stack: Vec<&str> = Vec::new();
                Self::walk(pid, &graph, &mut visited, &mut stack, &mut deadlocked);
            }
        }
        let mut members: Vec<String> = deadlocked.into_iter().map(str::to_string).collect();
        members.sort();
        if !members.is_empty() {
            tracing::warn!(processes = ?members, "deadlock detected");
        }
        members
    }

    fn walk<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, HashSet<&'a str>>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        deadlocked: &mut HashSet<&'a str>,
    ) {
        visited.insert(node);
        stack.push(node);
        if let Some(edges) = graph.get(node) {
            for &next in edges {
                if let Some(pos) = stack.iter().position(|&n| n == next) {
                    // Everything from the first occurrence onwards is in the cycle.
                    for &member in &stack[pos..] {
                        deadlocked.insert(member);
                    }
                } else if !visited.contains(next) {
                    Self::walk(next, graph, visited, stack, deadlocked);
                }
            }
        }
        stack.pop();
    }

    pub fn status(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "resources": inner.resources.iter().map(|(name, r)| {
                (name.clone(), serde_json::json!({
                    "kind": r.kind,
                    "total": r.total,
                    "available": r.available,
                    "allocations": r.allocated,
                }))
            }).collect::<HashMap<_, _>>(),
            "processes": inner.processes.iter().map(|(pid, c)| {
                (pid.clone(), serde_json::json!({
                    "allocation": c.allocation,
                    "need": c.need,
                    "max_need": c.max_need,
                }))
            }).collect::<HashMap<_, _>>(),
            "safe_state": Self::is_safe(&inner),
        })
    }
}

impl Default for ResourceArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn need(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn grants_within_need_and_availability() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("R", "GENERIC", 10);
        arbiter.register_process("P1", need(&[("R", 7)]));
        arbiter.request("P1", "R", 5).unwrap();
        assert!(matches!(arbiter.request("P1", "R", 3), Err((ErrorKind::ExceedsNeed, _))));
    }

    #[test]
    fn zero_unit_requests_are_noops() {
        let arbiter = ResourceArbiter::new();
        arbiter.request("nobody", "nothing", 0).unwrap();
    }

    #[test]
    fn unknown_resource_and_process_error_out() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("R", "GENERIC", 1);
        assert!(matches!(arbiter.request("ghost", "R", 1), Err((ErrorKind::UnknownPid, _))));
        arbiter.register_process("P1", need(&[("R", 1)]));
        assert!(matches!(arbiter.request("P1", "X", 1), Err((ErrorKind::UnknownResource, _))));
    }

    /// The banker denial walkthrough: R has 10 units, P1 max 7 holds 5,
    /// P2 max 4 holds 2, P3 max 9 holds 2.
    #[test]
    fn banker_denies_overcommit_then_unsafe() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("R", "GENERIC", 10);
        arbiter.register_process("P1", need(&[("R", 7)]));
        arbiter.register_process("P2", need(&[("R", 4)]));
        arbiter.register_process("P3", need(&[("R", 9)]));
        arbiter.request("P1", "R", 5).unwrap();
        arbiter.request("P2", "R", 2).unwrap();
        arbiter.request("P3", "R", 2).unwrap();

        // Available = 1, so 2 more cannot even be allocated.
        assert!(matches!(arbiter.request("P3", "R", 2), Err((ErrorKind::ExceedsAvailable, _))));

        // 1 more is allocatable but leaves needs (2,2,6) against 0 available.
        assert!(matches!(arbiter.request("P3", "R", 1), Err((ErrorKind::Unsafe, _))));

        // Denial rolled back: the original holdings are untouched.
        let status = arbiter.status();
        assert_eq!(status["resources"]["R"]["available"], 1);
        assert_eq!(status["processes"]["P3"]["allocation"]["R"], 2);
        assert_eq!(status["safe_state"], true);
    }

    #[test]
    fn release_returns_units() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("R", "GENERIC", 4);
        arbiter.register_process("P1", need(&[("R", 4)]));
        arbiter.request("P1", "R", 4).unwrap();
        assert!(matches!(arbiter.release("P1", "R", 5), Err((ErrorKind::BadRequest, _))));
        arbiter.release("P1", "R", 4).unwrap();
        assert_eq!(arbiter.status()["resources"]["R"]["available"], 4);
    }

    #[test]
    fn wait_for_cycle_is_reported() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("A", "GENERIC", 1);
        arbiter.register_resource("B", "GENERIC", 1);
        arbiter.register_process("P1", need(&[("A", 1), ("B", 1)]));
        arbiter.register_process("P2", need(&[("A", 1), ("B", 1)]));
        arbiter.request("P1", "A", 1).unwrap();
        arbiter.request("P2", "B", 1).unwrap();

        // P1 still needs B (held by P2), P2 still needs A (held by P1).
        let members = arbiter.detect_deadlock();
        assert_eq!(members, vec!["P1".to_string(), "P2".to_string()]);
    }

    #[test]
    fn no_deadlock_when_needs_are_satisfiable() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("A", "GENERIC", 2);
        arbiter.register_process("P1", need(&[("A", 2)]));
        arbiter.request("P1", "A", 1).unwrap();
        assert!(arbiter.detect_deadlock().is_empty());
    }

    #[test]
    fn retire_returns_all_holdings() {
        let arbiter = ResourceArbiter::new();
        arbiter.register_resource("R", "GENERIC", 5);
        arbiter.register_process("P1", need(&[("R", 5)]));
        arbiter.request("P1", "R", 3).unwrap();
        arbiter.retire_process("P1");
        assert_eq!(arbiter.status()["resources"]["R"]["available"], 5);
        assert!(!arbiter.is_registered("P1"));
    }
}
