//! The message vocabulary shared by tracker and peers.
//!
//! One tagged enum covers every request and response; the `type` field on the
//! wire selects the variant. Responses that carry no payload use [`Message::Ok`],
//! failures use [`Message::Error`] with a category tag from [`ErrorKind`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{Discipline, PeerAddr, PeerId, TaskSpec};

/// Error taxonomy carried on the wire next to the human-readable message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    #[default]
    #[error("bad request")]
    BadRequest,
    #[error("unknown key")]
    UnknownKey,
    #[error("unknown file")]
    UnknownFile,
    #[error("unknown pid")]
    UnknownPid,
    #[error("unknown resource")]
    UnknownResource,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("not owner")]
    NotOwner,
    #[error("cancelled")]
    Cancelled,
    #[error("exceeds available units")]
    ExceedsAvailable,
    #[error("exceeds declared need")]
    ExceedsNeed,
    #[error("allocation would be unsafe")]
    Unsafe,
    #[error("out of memory")]
    OutOfMemory,
    #[error("task failed")]
    TaskFailed,
    #[error("timed out")]
    TimedOut,
    #[error("transport error")]
    Transport,
    #[error("fatal error")]
    Fatal,
}

/// Outcome of one task, embedded in `CPU_RESULT` and `BATCH_RESULT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
    #[serde(default)]
    pub cached: bool,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            result: Some(result),
            error: None,
            kind: None,
            executed_by: None,
            cached: false,
        }
    }

    pub fn failure(task_id: impl Into<String>, kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            result: None,
            error: Some(error.into()),
            kind: Some(kind),
            executed_by: None,
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // --- peer → tracker ---
    Register {
        identity: PeerId,
        address: PeerAddr,
        #[serde(default)]
        load: f64,
    },
    Unregister {
        identity: PeerId,
    },
    UpdateLoad {
        identity: PeerId,
        load: f64,
    },
    RequestBestPeer {
        identity: PeerId,
        #[serde(default)]
        exclude_self: bool,
    },
    BestPeer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<PeerAddr>,
        #[serde(default)]
        load: f64,
    },
    RegisterFile {
        identity: PeerId,
        filename: String,
    },
    UnregisterFile {
        identity: PeerId,
        filename: String,
    },
    FindFile {
        filename: String,
    },
    FilePeers {
        filename: String,
        addresses: Vec<PeerAddr>,
    },
    RegisterOwnedFile {
        owner_id: PeerId,
        owner_address: PeerAddr,
        storage_identity: PeerId,
        filename: String,
    },
    FindOwnedFile {
        filename: String,
        requester_id: PeerId,
    },
    OwnedFilePeers {
        filename: String,
        storage_addresses: Vec<PeerAddr>,
    },
    /// Sent both to the tracker (authorization + entry removal) and to each
    /// storage peer (blob removal).
    DeleteOwnedFile {
        filename: String,
        requester_id: PeerId,
    },

    // --- compute ---
    CpuTask {
        #[serde(flatten)]
        task: TaskSpec,
    },
    CpuResult {
        #[serde(flatten)]
        outcome: TaskResult,
    },
    BatchTask {
        tasks: Vec<TaskSpec>,
    },
    BatchResult {
        results: Vec<TaskResult>,
    },
    CancelTask {
        task_id: String,
    },
    TaskHistory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    SetScheduler {
        algorithm: Discipline,
    },

    // --- memory ---
    SetMem {
        key: String,
        value: Value,
    },
    GetMem {
        key: String,
    },
    DelMem {
        key: String,
    },
    ListMem,
    MemResponse {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        found: bool,
    },
    SetMemRemote {
        address: PeerAddr,
        key: String,
        value: Value,
    },
    GetMemRemote {
        address: PeerAddr,
        key: String,
    },

    // --- files ---
    PutFile {
        filename: String,
        /// base64 file bytes
        data: String,
    },
    GetFile {
        filename: String,
    },
    FileResponse {
        filename: String,
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default)]
        size: u64,
    },
    DeleteFile {
        filename: String,
    },
    ListFile,
    StatFile {
        filename: String,
    },
    FileStat {
        filename: String,
        found: bool,
        size: u64,
    },
    GetFileChunk {
        filename: String,
        offset: u64,
        len: u64,
    },
    FileChunk {
        filename: String,
        offset: u64,
        data: String,
    },
    /// Fetch an advertised file from the network (multi-peer chunked).
    DownloadFile {
        filename: String,
    },

    // --- owned files ---
    UploadToPeer {
        filename: String,
        /// base64-encoded ciphertext
        ciphertext: String,
        owner_id: PeerId,
        owner_address: PeerAddr,
    },
    GetOwnedFile {
        filename: String,
        owner_id: PeerId,
    },
    OwnedFileResponse {
        filename: String,
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default)]
        size: u64,
    },
    /// Owner-side entry point: hand plaintext to the local peer, which
    /// encrypts and distributes it to storage peers.
    UploadOwned {
        filename: String,
        data: String,
        #[serde(default)]
        replication: usize,
    },
    DownloadOwned {
        filename: String,
    },
    DeleteOwned {
        filename: String,
    },
    ListOwned,

    // --- processes ---
    CreateProcess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default)]
        task: Value,
    },
    TerminateProcess {
        pid: String,
    },
    ProcessTree {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<String>,
    },
    CreateGroup {
        group_id: String,
        #[serde(default)]
        pids: Vec<String>,
    },
    KillGroup {
        group_id: String,
    },

    // --- resources ---
    RegisterResource {
        resource: String,
        #[serde(default)]
        kind: String,
        units: u64,
    },
    RegisterNeeds {
        pid: String,
        max_need: std::collections::HashMap<String, u64>,
    },
    RequestResource {
        pid: String,
        resource: String,
        #[serde(default = "one_unit")]
        units: u64,
    },
    ReleaseResource {
        pid: String,
        resource: String,
        #[serde(default = "one_unit")]
        units: u64,
    },
    CheckDeadlock,

    // --- block allocator ---
    AllocMem {
        pid: String,
        size: u64,
    },
    FreeMem {
        pid: String,
    },
    FragInfo,

    // --- IPC ---
    CreateQueue {
        queue_id: String,
        #[serde(default = "default_queue_capacity")]
        capacity: usize,
    },
    SendMsg {
        queue_id: String,
        sender: String,
        #[serde(default = "broadcast_receiver")]
        receiver: String,
        #[serde(default)]
        data: Value,
    },
    RecvMsg {
        queue_id: String,
        receiver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<f64>,
    },
    CreateSem {
        sem_id: String,
        #[serde(default = "one_permit")]
        initial: i64,
    },
    WaitSem {
        sem_id: String,
        pid: String,
    },
    SignalSem {
        sem_id: String,
        pid: String,
    },

    // --- liveness / status ---
    Status,
    Ping {
        #[serde(default)]
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },

    // --- generic responses ---
    Ok {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Error {
        error: String,
        #[serde(default)]
        kind: ErrorKind,
    },
}

fn one_unit() -> u64 {
    1
}

fn one_permit() -> i64 {
    1
}

fn default_queue_capacity() -> usize {
    100
}

fn broadcast_receiver() -> String {
    "*".to_string()
}

impl Message {
    pub fn ok() -> Self {
        Message::Ok { data: Value::Null }
    }

    pub fn ok_with(data: Value) -> Self {
        Message::Ok { data }
    }

    pub fn error(kind: ErrorKind, error: impl Into<String>) -> Self {
        Message::Error { error: error.into(), kind }
    }

    /// The wire `type` tag for this message, mainly for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "REGISTER",
            Message::Unregister { .. } => "UNREGISTER",
            Message::UpdateLoad { .. } => "UPDATE_LOAD",
            Message::RequestBestPeer { .. } => "REQUEST_BEST_PEER",
            Message::BestPeer { .. } => "BEST_PEER",
            Message::RegisterFile { .. } => "REGISTER_FILE",
            Message::UnregisterFile { .. } => "UNREGISTER_FILE",
            Message::FindFile { .. } => "FIND_FILE",
            Message::FilePeers { .. } => "FILE_PEERS",
            Message::RegisterOwnedFile { .. } => "REGISTER_OWNED_FILE",
            Message::FindOwnedFile { .. } => "FIND_OWNED_FILE",
            Message::OwnedFilePeers { .. } => "OWNED_FILE_PEERS",
            Message::DeleteOwnedFile { .. } => "DELETE_OWNED_FILE",
            Message::CpuTask { .. } => "CPU_TASK",
            Message::CpuResult { .. } => "CPU_RESULT",
            Message::BatchTask { .. } => "BATCH_TASK",
            Message::BatchResult { .. } => "BATCH_RESULT",
            Message::CancelTask { .. } => "CANCEL_TASK",
            Message::TaskHistory { .. } => "TASK_HISTORY",
            Message::SetScheduler { .. } => "SET_SCHEDULER",
            Message::SetMem { .. } => "SET_MEM",
            Message::GetMem { .. } => "GET_MEM",
            Message::DelMem { .. } => "DEL_MEM",
            Message::ListMem => "LIST_MEM",
            Message::MemResponse { .. } => "MEM_RESPONSE",
            Message::SetMemRemote { .. } => "SET_MEM_REMOTE",
            Message::GetMemRemote { .. } => "GET_MEM_REMOTE",
            Message::PutFile { .. } => "PUT_FILE",
            Message::GetFile { .. } => "GET_FILE",
            Message::FileResponse { .. } => "FILE_RESPONSE",
            Message::DeleteFile { .. } => "DELETE_FILE",
            Message::ListFile => "LIST_FILE",
            Message::StatFile { .. } => "STAT_FILE",
            Message::FileStat { .. } => "FILE_STAT",
            Message::GetFileChunk { .. } => "GET_FILE_CHUNK",
            Message::FileChunk { .. } => "FILE_CHUNK",
            Message::DownloadFile { .. } => "DOWNLOAD_FILE",
            Message::UploadToPeer { .. } => "UPLOAD_TO_PEER",
            Message::GetOwnedFile { .. } => "GET_OWNED_FILE",
            Message::OwnedFileResponse { .. } => "OWNED_FILE_RESPONSE",
            Message::UploadOwned { .. } => "UPLOAD_OWNED",
            Message::DownloadOwned { .. } => "DOWNLOAD_OWNED",
            Message::DeleteOwned { .. } => "DELETE_OWNED",
            Message::ListOwned => "LIST_OWNED",
            Message::CreateProcess { .. } => "CREATE_PROCESS",
            Message::TerminateProcess { .. } => "TERMINATE_PROCESS",
            Message::ProcessTree { .. } => "PROCESS_TREE",
            Message::CreateGroup { .. } => "CREATE_GROUP",
            Message::KillGroup { .. } => "KILL_GROUP",
            Message::RegisterResource { .. } => "REGISTER_RESOURCE",
            Message::RegisterNeeds { .. } => "REGISTER_NEEDS",
            Message::RequestResource { .. } => "REQUEST_RESOURCE",
            Message::ReleaseResource { .. } => "RELEASE_RESOURCE",
            Message::CheckDeadlock => "CHECK_DEADLOCK",
            Message::AllocMem { .. } => "ALLOC_MEM",
            Message::FreeMem { .. } => "FREE_MEM",
            Message::FragInfo => "FRAG_INFO",
            Message::CreateQueue { .. } => "CREATE_QUEUE",
            Message::SendMsg { .. } => "SEND_MSG",
            Message::RecvMsg { .. } => "RECV_MSG",
            Message::CreateSem { .. } => "CREATE_SEM",
            Message::WaitSem { .. } => "WAIT_SEM",
            Message::SignalSem { .. } => "SIGNAL_SEM",
            Message::Status => "STATUS",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Ok { .. } => "OK",
            Message::Error { .. } => "ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_task_flattens_spec_fields() {
        let msg = Message::CpuTask {
            task: TaskSpec::new("t1", "x*x", "f", vec![serde_json::json!(7)]),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "CPU_TASK");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["program"], "x*x");
        assert_eq!(json["args"][0], 7);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let msg: Message = serde_json::from_str(
            r#"{"type":"GET_MEM","key":"k","extra":"ignored"}"#,
        )
        .unwrap();
        assert!(matches!(msg, Message::GetMem { ref key } if key == "k"));
    }

    #[test]
    fn error_kind_defaults_to_bad_request() {
        let msg: Message = serde_json::from_str(r#"{"type":"ERROR","error":"boom"}"#).unwrap();
        match msg {
            Message::Error { error, kind } => {
                assert_eq!(error, "boom");
                assert_eq!(kind, ErrorKind::BadRequest);
            }
            other => panic!("expected ERROR, got {}", other.kind_name()),
        }
    }

    #[test]
    fn register_uses_pair_address() {
        let msg = Message::Register {
            identity: "abc".into(),
            address: PeerAddr::new("127.0.0.1", 9000),
            load: 0.5,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "REGISTER");
        assert_eq!(json["address"][0], "127.0.0.1");
        assert_eq!(json["address"][1], 9000);
    }

    #[test]
    fn send_msg_defaults_to_broadcast() {
        let msg: Message = serde_json::from_str(
            r#"{"type":"SEND_MSG","queue_id":"q","sender":"P1","data":42}"#,
        )
        .unwrap();
        match msg {
            Message::SendMsg { receiver, .. } => assert_eq!(receiver, "*"),
            other => panic!("expected SEND_MSG, got {}", other.kind_name()),
        }
    }
}
