use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable peer identity: a UUID string generated on first start and kept for
/// the lifetime of the peer, across restarts and address changes.
pub type PeerId = String;

/// A network endpoint. Serializes as `[host, port]`, which is also the form
/// used in the tracker's persisted owned-file registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl From<(String, u16)> for PeerAddr {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<PeerAddr> for (String, u16) {
    fn from(addr: PeerAddr) -> Self {
        (addr.host, addr.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A compute task as it travels on the wire.
///
/// The fabric treats `program` as opaque: whatever the configured task runner
/// understands. `source_peer` is set by a dispatching peer so the executing
/// side never re-dispatches a forwarded task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub program: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub confidential: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_retries: u32,
    /// Per-task timeout in seconds; falls back to the peer's default.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Estimated runtime in seconds, the SJF ordering key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_runtime: Option<f64>,
    /// Declared resource needs, acquired through the arbiter before the task
    /// runs and released afterwards.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resources: HashMap<String, u64>,
    /// Endpoint of the peer that forwarded this task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_peer: Option<String>,
}

impl TaskSpec {
    pub fn new(task_id: impl Into<String>, program: impl Into<String>, function: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            task_id: task_id.into(),
            program: program.into(),
            function: function.into(),
            args,
            confidential: false,
            priority: 0,
            max_retries: 0,
            timeout_secs: None,
            estimated_runtime: None,
            resources: HashMap::new(),
            source_peer: None,
        }
    }
}

/// Terminal and non-terminal task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Scheduling discipline for the peer's dispatch worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discipline {
    #[serde(rename = "FCFS")]
    Fcfs,
    #[serde(rename = "SJF")]
    Sjf,
    #[serde(rename = "PRIORITY")]
    Priority,
    #[serde(rename = "RR")]
    RoundRobin,
}

impl Discipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discipline::Fcfs => "FCFS",
            Discipline::Sjf => "SJF",
            Discipline::Priority => "PRIORITY",
            Discipline::RoundRobin => "RR",
        }
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Discipline {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FCFS" => Ok(Discipline::Fcfs),
            "SJF" => Ok(Discipline::Sjf),
            "PRIORITY" => Ok(Discipline::Priority),
            "RR" | "ROUND_ROBIN" => Ok(Discipline::RoundRobin),
            other => Err(format!("unknown scheduling discipline: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addr_serializes_as_pair() {
        let addr = PeerAddr::new("10.0.0.7", 9001);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"["10.0.0.7",9001]"#);
        let back: PeerAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn task_spec_defaults_fill_in() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"task_id":"t1","program":"x*x","function":"f","args":[7]}"#,
        )
        .unwrap();
        assert!(!spec.confidential);
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.max_retries, 0);
        assert!(spec.resources.is_empty());
        assert!(spec.source_peer.is_none());
    }

    #[test]
    fn discipline_round_trips_wire_names() {
        for (d, name) in [
            (Discipline::Fcfs, "\"FCFS\""),
            (Discipline::Sjf, "\"SJF\""),
            (Discipline::Priority, "\"PRIORITY\""),
            (Discipline::RoundRobin, "\"RR\""),
        ] {
            assert_eq!(serde_json::to_string(&d).unwrap(), name);
        }
        assert_eq!("rr".parse::<Discipline>().unwrap(), Discipline::RoundRobin);
        assert!("LOTTERY".parse::<Discipline>().is_err());
    }
}
