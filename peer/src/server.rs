//! The peer's TCP server: accept, read one framed request, route it across
//! the subsystems, write one response, close.

use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use weft_protocol::{wire, ErrorKind, Message};

use crate::node::PeerNode;
use crate::os::ipc::WaitOutcome;

pub async fn serve(node: Arc<PeerNode>, listener: TcpListener) -> Result<()> {
    // Soft connection cap; excess connections queue on the accept side.
    let permits = Arc::new(Semaphore::new(node.cfg.max_connections));
    loop {
        let (stream, remote) = listener.accept().await?;
        let permit = permits.clone().acquire_owned().await?;
        let node = node.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_connection(node, stream).await {
                tracing::debug!(remote = %remote, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(node: Arc<PeerNode>, mut stream: TcpStream) -> Result<()> {
    let msg = match wire::read_message(&mut stream, node.cfg.max_frame_bytes).await {
        Ok(msg) => msg,
        Err(e) => {
            // Framing failures drop the connection without touching state.
            tracing::debug!(error = %e, "unreadable request frame");
            return Ok(());
        }
    };
    tracing::debug!(message_type = msg.kind_name(), "request");
    let response = dispatch(&node, msg).await;
    wire::write_message(&mut stream, &response).await?;
    Ok(())
}

fn protocol_err((kind, message): (ErrorKind, String)) -> Message {
    Message::error(kind, message)
}

pub async fn dispatch(node: &Arc<PeerNode>, msg: Message) -> Message {
    match msg {
        // --- compute ---
        Message::CpuTask { task } => {
            let outcome = node.handle_cpu_task(task).await;
            Message::CpuResult { outcome }
        }
        Message::BatchTask { tasks } => {
            if tasks.is_empty() {
                return Message::error(ErrorKind::BadRequest, "no tasks provided");
            }
            let results = node.handle_batch(tasks).await;
            Message::BatchResult { results }
        }
        Message::CancelTask { task_id } => {
            if node.scheduler.cancel(&task_id) {
                Message::ok_with(json!({ "task_id": task_id, "status": "cancelled" }))
            } else {
                Message::error(
                    ErrorKind::BadRequest,
                    format!("task {task_id} not found or already executing"),
                )
            }
        }
        Message::TaskHistory { limit, task_id } => match task_id {
            Some(id) => match node.history.find(&id) {
                Some(entry) => Message::ok_with(json!({ "task": entry })),
                None => Message::error(ErrorKind::BadRequest, format!("no history for task {id}")),
            },
            None => {
                let entries = node.history.recent(limit.unwrap_or(100));
                Message::ok_with(json!({
                    "history": entries,
                    "statistics": node.history.statistics(),
                }))
            }
        },
        Message::SetScheduler { algorithm } => {
            node.scheduler.set_discipline(algorithm);
            Message::ok_with(json!({ "algorithm": algorithm.as_str() }))
        }

        // --- memory ---
        Message::SetMem { key, value } => {
            if node.memory.get(&key).is_none() {
                if let Err(e) = node.quota.admit_key(node.memory.key_count()) {
                    return protocol_err(e);
                }
            }
            node.memory.set(&key, value);
            Message::ok_with(json!({ "operation": "SET_MEM", "key": key }))
        }
        Message::GetMem { key } => {
            let value = node.memory.get(&key);
            let found = value.is_some();
            Message::MemResponse { key, value, found }
        }
        Message::DelMem { key } => {
            if node.memory.delete(&key) {
                Message::ok_with(json!({ "operation": "DEL_MEM", "key": key }))
            } else {
                Message::error(ErrorKind::UnknownKey, format!("no such key: {key}"))
            }
        }
        Message::ListMem => Message::ok_with(json!({ "keys": node.memory.keys() })),
        Message::SetMemRemote { address, key, value } => {
            match node.client.call_peer(&address, &Message::SetMem { key, value }).await {
                Ok(reply) => reply,
                Err(e) => Message::error(ErrorKind::Transport, e.to_string()),
            }
        }
        Message::GetMemRemote { address, key } => {
            match node.client.call_peer(&address, &Message::GetMem { key }).await {
                Ok(reply) => reply,
                Err(e) => Message::error(ErrorKind::Transport, e.to_string()),
            }
        }

        // --- local files ---
        Message::PutFile { filename, data } => {
            let bytes = match BASE64.decode(data.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => return Message::error(ErrorKind::BadRequest, format!("undecodable file data: {e}")),
            };
            if bytes.len() as u64 > node.cfg.max_file_bytes {
                return Message::error(
                    ErrorKind::BadRequest,
                    format!("file too large (max {} bytes)", node.cfg.max_file_bytes),
                );
            }
            if let Err(e) = node.quota.charge_storage(bytes.len() as u64) {
                return protocol_err(e);
            }
            if let Err(kind) = node.files.put(&filename, &bytes).await {
                node.quota.release_storage(bytes.len() as u64);
                return Message::error(kind, format!("storing {filename} failed"));
            }
            if let Err(e) = node.client.register_file(&node.identity, &filename).await {
                tracing::debug!(filename = %filename, error = %e, "file advertisement failed");
            }
            Message::ok_with(json!({ "operation": "PUT_FILE", "filename": filename, "size": bytes.len() }))
        }
        Message::GetFile { filename } => match node.files.get(&filename).await {
            Ok(Some(bytes)) => {
                let size = bytes.len() as u64;
                Message::FileResponse {
                    filename,
                    found: true,
                    data: Some(BASE64.encode(bytes)),
                    size,
                }
            }
            Ok(None) => {
                if node.owned.holds(&filename) {
                    Message::error(
                        ErrorKind::NotOwner,
                        "file is held for another peer; use GET_OWNED_FILE",
                    )
                } else {
                    Message::error(ErrorKind::UnknownFile, format!("no such file: {filename}"))
                }
            }
            Err(kind) => Message::error(kind, format!("reading {filename} failed")),
        },
        Message::DeleteFile { filename } => {
            let size = node.files.size(&filename).await.ok().flatten();
            match node.files.delete(&filename).await {
                Ok(true) => {
                    node.quota.release_storage(size.unwrap_or(0));
                    if let Err(e) = node.client.unregister_file(&node.identity, &filename).await {
                        tracing::debug!(filename = %filename, error = %e, "file un-advertisement failed");
                    }
                    Message::ok_with(json!({ "operation": "DELETE_FILE", "filename": filename }))
                }
                Ok(false) => Message::error(ErrorKind::UnknownFile, format!("no such file: {filename}")),
                Err(kind) => Message::error(kind, format!("deleting {filename} failed")),
            }
        }
        Message::ListFile => Message::ok_with(json!({ "files": node.files.list().await })),
        Message::StatFile { filename } => match node.files.size(&filename).await {
            Ok(Some(size)) => Message::FileStat { filename, found: true, size },
            Ok(None) => Message::FileStat { filename, found: false, size: 0 },
            Err(kind) => Message::error(kind, format!("stating {filename} failed")),
        },
        Message::GetFileChunk { filename, offset, len } => {
            match node.files.read_chunk(&filename, offset, len).await {
                Ok(Some(bytes)) => Message::FileChunk {
                    filename,
                    offset,
                    data: BASE64.encode(bytes),
                },
                Ok(None) => Message::error(ErrorKind::UnknownFile, format!("no such file: {filename}")),
                Err(kind) => Message::error(kind, format!("reading {filename} failed")),
            }
        }
        Message::DownloadFile { filename } => match node.download_file(&filename).await {
            Ok(bytes) => {
                let size = bytes.len() as u64;
                Message::FileResponse {
                    filename,
                    found: true,
                    data: Some(BASE64.encode(bytes)),
                    size,
                }
            }
            Err(e) => protocol_err(e),
        },
        Message::FindFile { filename } => match node.client.find_file(&filename).await {
            Ok(addresses) => Message::FilePeers { filename, addresses },
            Err(e) => Message::error(ErrorKind::Transport, e.to_string()),
        },

        // --- owned files ---
        Message::UploadToPeer { filename, ciphertext, owner_id, owner_address } => {
            match node.handle_upload_to_peer(&filename, &ciphertext, owner_id, owner_address).await {
                Ok(size) => Message::ok_with(json!({ "filename": filename, "size": size })),
                Err(e) => protocol_err(e),
            }
        }
        Message::GetOwnedFile { filename, owner_id } => {
            match node.owned.fetch(&filename, &owner_id).await {
                Ok(bytes) => {
                    let size = bytes.len() as u64;
                    Message::OwnedFileResponse {
                        filename,
                        found: true,
                        data: Some(BASE64.encode(bytes)),
                        size,
                    }
                }
                Err(kind) => Message::error(kind, format!("{filename}: {kind}")),
            }
        }
        Message::DeleteOwnedFile { filename, requester_id } => {
            match node.handle_delete_owned(&filename, &requester_id).await {
                Ok(()) => Message::ok_with(json!({ "filename": filename })),
                Err(e) => protocol_err(e),
            }
        }
        Message::UploadOwned { filename, data, replication } => {
            let plaintext = match BASE64.decode(data.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => return Message::error(ErrorKind::BadRequest, format!("undecodable file data: {e}")),
            };
            match node.upload_owned(&filename, &plaintext, replication).await {
                Ok(storage_peers) => Message::ok_with(json!({
                    "filename": filename,
                    "storage_peers": storage_peers,
                })),
                Err(e) => protocol_err(e),
            }
        }
        Message::DownloadOwned { filename } => match node.download_owned(&filename).await {
            Ok(bytes) => {
                let size = bytes.len() as u64;
                Message::OwnedFileResponse {
                    filename,
                    found: true,
                    data: Some(BASE64.encode(bytes)),
                    size,
                }
            }
            Err(e) => protocol_err(e),
        },
        Message::DeleteOwned { filename } => match node.delete_owned(&filename).await {
            Ok(()) => Message::ok_with(json!({ "filename": filename })),
            Err(e) => protocol_err(e),
        },
        Message::ListOwned => Message::ok_with(json!({ "files": node.list_owned() })),

        // --- processes ---
        Message::CreateProcess { parent, group, task } => {
            if let Some(parent_pid) = &parent {
                if !node.processes.contains(parent_pid) {
                    return Message::error(ErrorKind::UnknownPid, format!("no such process: {parent_pid}"));
                }
            }
            let pid = node.processes.create(task, parent, group);
            Message::ok_with(json!({ "pid": pid }))
        }
        Message::TerminateProcess { pid } => {
            if node.processes.terminate(&pid) {
                Message::ok_with(json!({ "pid": pid }))
            } else {
                Message::error(ErrorKind::UnknownPid, format!("no such process: {pid}"))
            }
        }
        Message::ProcessTree { root } => {
            if let Some(root_pid) = &root {
                if !node.processes.contains(root_pid) {
                    return Message::error(ErrorKind::UnknownPid, format!("no such process: {root_pid}"));
                }
            }
            Message::ok_with(json!({ "tree": node.processes.tree(root.as_deref()) }))
        }
        Message::CreateGroup { group_id, pids } => {
            node.processes.create_group(&group_id, &pids);
            Message::ok_with(json!({ "group_id": group_id }))
        }
        Message::KillGroup { group_id } => {
            let terminated = node.processes.kill_group(&group_id);
            Message::ok_with(json!({ "group_id": group_id, "terminated": terminated }))
        }

        // --- resources ---
        Message::RegisterResource { resource, kind, units } => {
            let kind = if kind.is_empty() { "GENERIC".to_string() } else { kind };
            node.resources.register_resource(&resource, &kind, units);
            Message::ok_with(json!({ "resource": resource, "units": units }))
        }
        Message::RegisterNeeds { pid, max_need } => {
            node.resources.register_process(&pid, max_need);
            Message::ok_with(json!({ "pid": pid }))
        }
        Message::RequestResource { pid, resource, units } => {
            match node.resources.request(&pid, &resource, units) {
                Ok(()) => Message::ok_with(json!({ "pid": pid, "resource": resource, "units": units })),
                Err(e) => protocol_err(e),
            }
        }
        Message::ReleaseResource { pid, resource, units } => {
            match node.resources.release(&pid, &resource, units) {
                Ok(()) => Message::ok_with(json!({ "pid": pid, "resource": resource })),
                Err(e) => protocol_err(e),
            }
        }
        Message::CheckDeadlock => {
            let deadlocked = node.resources.detect_deadlock();
            Message::ok_with(json!({
                "deadlock": !deadlocked.is_empty(),
                "deadlocked_processes": deadlocked,
            }))
        }

        // --- block allocator ---
        Message::AllocMem { pid, size } => match node.allocator.allocate(&pid, size) {
            Ok(offset) => Message::ok_with(json!({ "pid": pid, "offset": offset, "size": size })),
            Err(e) => protocol_err(e),
        },
        Message::FreeMem { pid } => match node.allocator.deallocate(&pid) {
            Ok(()) => Message::ok_with(json!({ "pid": pid })),
            Err(e) => protocol_err(e),
        },
        Message::FragInfo => Message::ok_with(node.allocator.fragmentation()),

        // --- IPC ---
        Message::CreateQueue { queue_id, capacity } => {
            if node.ipc.create_queue(&queue_id, capacity) {
                Message::ok_with(json!({ "queue_id": queue_id }))
            } else {
                Message::error(ErrorKind::BadRequest, format!("queue {queue_id} already exists"))
            }
        }
        Message::SendMsg { queue_id, sender, receiver, data } => {
            let Some(queue) = node.ipc.queue(&queue_id) else {
                return Message::error(ErrorKind::BadRequest, format!("no such queue: {queue_id}"));
            };
            match queue.send(&sender, &receiver, data) {
                Ok(message_id) => Message::ok_with(json!({ "message_id": message_id })),
                Err(e) => protocol_err(e),
            }
        }
        Message::RecvMsg { queue_id, receiver, timeout_secs } => {
            let Some(queue) = node.ipc.queue(&queue_id) else {
                return Message::error(ErrorKind::BadRequest, format!("no such queue: {queue_id}"));
            };
            let timeout = timeout_secs.map(|s| std::time::Duration::from_secs_f64(s.max(0.0)));
            match queue.receive(&receiver, timeout).await {
                Some(message) => Message::ok_with(json!({ "message": message })),
                None => Message::error(ErrorKind::TimedOut, "no message received"),
            }
        }
        Message::CreateSem { sem_id, initial } => {
            if node.ipc.create_semaphore(&sem_id, initial) {
                Message::ok_with(json!({ "sem_id": sem_id }))
            } else {
                Message::error(ErrorKind::BadRequest, format!("semaphore {sem_id} already exists"))
            }
        }
        Message::WaitSem { sem_id, pid } => {
            let Some(sem) = node.ipc.semaphore(&sem_id) else {
                return Message::error(ErrorKind::BadRequest, format!("no such semaphore: {sem_id}"));
            };
            let (status, value) = match sem.wait(&pid) {
                WaitOutcome::Acquired(value) => ("OK", value),
                WaitOutcome::Blocked(value) => ("BLOCKED", value),
            };
            Message::ok_with(json!({ "sem_id": sem_id, "status": status, "value": value }))
        }
        Message::SignalSem { sem_id, pid } => {
            let Some(sem) = node.ipc.semaphore(&sem_id) else {
                return Message::error(ErrorKind::BadRequest, format!("no such semaphore: {sem_id}"));
            };
            let (woken, value) = sem.signal(&pid);
            Message::ok_with(json!({ "sem_id": sem_id, "value": value, "woken": woken }))
        }

        // --- liveness / status ---
        Message::Status => Message::ok_with(node.status().await),
        Message::Ping { nonce } => Message::Pong { nonce },

        other => Message::error(
            ErrorKind::BadRequest,
            format!("unsupported message type: {}", other.kind_name()),
        ),
    }
}
