//! The peer node: every subsystem wired together, plus the compute
//! submission path (admission → cache → schedule → result) and the remote
//! dispatch path through the tracker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use weft_protocol::{ErrorKind, Message, PeerAddr, PeerId, TaskResult, TaskSpec, TaskStatus};

use crate::cache::{fingerprint, ResultCache};
use crate::client::Client;
use crate::config::Config;
use crate::executor::TaskRunner;
use crate::history::{HistoryEntry, Role, TaskHistory};
use crate::identity;
use crate::memory::MemoryStore;
use crate::os::alloc::BlockAllocator;
use crate::os::ipc::IpcManager;
use crate::os::process::ProcessTable;
use crate::os::resources::ResourceArbiter;
use crate::quota::QuotaLedger;
use crate::scheduler::Scheduler;
use crate::storage::{FileStorage, OwnedStorage};

pub struct PeerNode {
    pub cfg: Config,
    pub identity: PeerId,
    pub client: Client,
    pub memory: MemoryStore,
    pub files: FileStorage,
    pub owned: OwnedStorage,
    pub cache: ResultCache,
    pub history: TaskHistory,
    pub quota: QuotaLedger,
    pub scheduler: Arc<Scheduler>,
    pub processes: Arc<ProcessTable>,
    pub resources: Arc<ResourceArbiter>,
    pub allocator: BlockAllocator,
    pub ipc: IpcManager,
    /// Files this peer owns → the storage peers holding them.
    pub owned_files: Mutex<HashMap<String, Vec<PeerAddr>>>,
}

impl PeerNode {
    pub async fn new(cfg: Config) -> Result<Arc<Self>> {
        let identity = identity::load_or_create(&cfg.identity_path()).await?;
        let files = FileStorage::open(cfg.storage_dir()).await?;
        let owned = OwnedStorage::open(cfg.owned_storage_dir()).await?;
        let client = Client::new(cfg.tracker.clone(), cfg.socket_timeout);
        let scheduler = Arc::new(Scheduler::new(cfg.discipline, cfg.task_timeout));

        let resources = Arc::new(ResourceArbiter::new());
        resources.register_resource("CPU", "CPU", 4);
        resources.register_resource("MEMORY", "MEMORY", 1000);
        resources.register_resource("DISK", "DISK", 10);

        let allocator = BlockAllocator::new(cfg.arena_bytes, cfg.fit_algorithm);

        Ok(Arc::new(Self {
            identity,
            client,
            memory: MemoryStore::new(),
            files,
            owned,
            cache: ResultCache::new(
                crate::cache::DEFAULT_CAPACITY,
                Duration::from_secs(crate::cache::DEFAULT_TTL_SECS),
            ),
            history: TaskHistory::new(crate::history::DEFAULT_CAPACITY),
            quota: QuotaLedger::default(),
            scheduler,
            processes: Arc::new(ProcessTable::new()),
            resources,
            allocator,
            ipc: IpcManager::new(),
            owned_files: Mutex::new(HashMap::new()),
            cfg,
        }))
    }

    pub fn endpoint(&self) -> String {
        self.cfg.advertised_addr().to_string()
    }

    /// Spawn the dispatch worker and the heartbeat loop, and make first
    /// contact with the tracker. Registration is best-effort: a missing
    /// tracker only delays discovery, never the local services.
    pub async fn start(self: &Arc<Self>, runner: Arc<dyn TaskRunner>) {
        tokio::spawn(self.scheduler.clone().run(
            self.processes.clone(),
            self.resources.clone(),
            runner,
        ));

        if let Err(e) = self.register_all().await {
            tracing::warn!(error = %e, "initial tracker registration failed, heartbeat will retry");
        }

        let node = self.clone();
        tokio::spawn(async move {
            node.heartbeat_loop().await;
        });
    }

    /// REGISTER plus re-advertising local files and re-reporting files held
    /// for other owners (rebuilds the tracker after either side restarts).
    pub async fn register_all(&self) -> Result<()> {
        let addr = self.cfg.advertised_addr();
        self.client
            .register(&self.identity, &addr, self.scheduler.load())
            .await?;
        tracing::info!(tracker = %self.client.tracker_addr(), "registered with tracker");

        for filename in self.files.list().await {
            if let Err(e) = self.client.register_file(&self.identity, &filename).await {
                tracing::debug!(filename = %filename, error = %e, "file advertisement failed");
            }
        }
        for (filename, meta) in self.owned.entries() {
            if let Err(e) = self
                .client
                .register_owned_file(&meta.owner_id, &meta.owner_address, &self.identity, &filename)
                .await
            {
                tracing::debug!(filename = %filename, error = %e, "owned-file report failed");
            }
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.cfg.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // immediate first tick; registration already ran
        loop {
            interval.tick().await;
            let load = self.scheduler.load();
            match self.client.update_load(&self.identity, load).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("tracker lost our registration, re-registering");
                    if let Err(e) = self.register_all().await {
                        tracing::warn!(error = %e, "re-registration failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "heartbeat failed");
                }
            }
        }
    }

    /// Entry point for CPU_TASK from the wire and from batches.
    ///
    /// Confidential tasks always run locally and never touch the tracker.
    /// Tasks carrying `source_peer` were forwarded by another peer and must
    /// not be re-dispatched.
    pub async fn handle_cpu_task(self: &Arc<Self>, task: TaskSpec) -> TaskResult {
        if task.confidential || task.source_peer.is_some() {
            self.execute_locally(task).await
        } else {
            self.dispatch(task).await
        }
    }

    /// Admission → cache → scheduler, with scheduler-driven retries.
    pub async fn execute_locally(self: &Arc<Self>, task: TaskSpec) -> TaskResult {
        let endpoint = self.endpoint();
        let requested_by = task.source_peer.clone().unwrap_or_else(|| endpoint.clone());
        let task_id = task.task_id.clone();

        if let Err((kind, message)) = self.quota.admit_task() {
            let mut entry = HistoryEntry::new(&task_id, TaskStatus::Failed, Role::Executor);
            entry.error = Some(message.clone());
            entry.executed_by = Some(endpoint.clone());
            entry.requested_by = Some(requested_by);
            self.history.record(entry);
            let mut result = TaskResult::failure(task_id, kind, message);
            result.executed_by = Some(endpoint);
            return result;
        }

        let key = fingerprint(&task.program, &task.function, &task.args);
        if let Some(value) = self.cache.get(&key) {
            tracing::info!(task_id = %task_id, "cache hit");
            let mut entry = HistoryEntry::new(&task_id, TaskStatus::Completed, Role::Executor)
                .with_result(&value);
            entry.cached = true;
            entry.execution_time = Some(0.0);
            entry.executed_by = Some(endpoint.clone());
            entry.requested_by = Some(requested_by);
            self.history.record(entry);
            let mut result = TaskResult::success(task_id, value);
            result.cached = true;
            result.executed_by = Some(endpoint);
            return result;
        }

        let mut retries_left = task.max_retries;
        loop {
            let receiver = self.scheduler.submit(task.clone());
            let outcome = match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let mut result = TaskResult::failure(
                        task_id,
                        ErrorKind::Fatal,
                        "scheduler shut down mid-task",
                    );
                    result.executed_by = Some(endpoint);
                    return result;
                }
            };

            match outcome.status {
                TaskStatus::Completed => {
                    let value = outcome.result.clone().unwrap_or(serde_json::Value::Null);
                    self.cache.put(key, value.clone());
                    let mut entry = HistoryEntry::new(&task_id, TaskStatus::Completed, Role::Executor)
                        .with_result(&value);
                    entry.execution_time = Some(outcome.execution_secs);
                    entry.executed_by = Some(endpoint.clone());
                    entry.requested_by = Some(requested_by);
                    self.history.record(entry);
                    let mut result = TaskResult::success(task_id, value);
                    result.executed_by = Some(endpoint);
                    return result;
                }
                TaskStatus::Cancelled => {
                    let mut entry = HistoryEntry::new(&task_id, TaskStatus::Cancelled, Role::Executor);
                    entry.error = outcome.error.clone();
                    entry.executed_by = Some(endpoint.clone());
                    entry.requested_by = Some(requested_by);
                    self.history.record(entry);
                    let mut result = TaskResult::failure(
                        task_id,
                        ErrorKind::Cancelled,
                        outcome.error.unwrap_or_else(|| "task cancelled".to_string()),
                    );
                    result.executed_by = Some(endpoint);
                    return result;
                }
                TaskStatus::Failed | TaskStatus::TimedOut => {
                    if retries_left > 0 {
                        retries_left -= 1;
                        tracing::warn!(
                            task_id = %task_id,
                            retries_left,
                            error = outcome.error.as_deref().unwrap_or("unknown"),
                            "task unsuccessful, re-enqueueing"
                        );
                        continue;
                    }
                    let kind = outcome.kind.unwrap_or(ErrorKind::TaskFailed);
                    let message = outcome.error.unwrap_or_else(|| "task failed".to_string());
                    let mut entry = HistoryEntry::new(&task_id, outcome.status, Role::Executor);
                    entry.error = Some(message.clone());
                    entry.execution_time = Some(outcome.execution_secs);
                    entry.executed_by = Some(endpoint.clone());
                    entry.requested_by = Some(requested_by);
                    self.history.record(entry);
                    let mut result = TaskResult::failure(task_id, kind, message);
                    result.executed_by = Some(endpoint);
                    return result;
                }
                TaskStatus::Queued | TaskStatus::Running => unreachable!("scheduler reports terminal states only"),
            }
        }
    }

    /// Forward a task to the least-loaded peer the tracker names, retrying
    /// with exponential backoff and jitter on transport failures. Falls back
    /// to local execution when no other peer is eligible.
    async fn dispatch(self: &Arc<Self>, task: TaskSpec) -> TaskResult {
        let endpoint = self.endpoint();
        let task_id = task.task_id.clone();
        let attempts = task.max_retries.saturating_add(1);
        let mut failed: Vec<PeerAddr> = Vec::new();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(200) * 2u32.saturating_pow(attempt - 1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                tokio::time::sleep(backoff + jitter).await;
            }

            let target = match self.client.request_best_peer(&self.identity, true).await {
                Ok(Some(addr)) => addr,
                Ok(None) => {
                    tracing::info!(task_id = %task_id, "no other peer available, executing locally");
                    return self.execute_locally(task).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(task_id = %task_id, error = %last_error, "tracker lookup failed");
                    continue;
                }
            };
            if failed.contains(&target) && attempt + 1 < attempts {
                // Load may shift and free a different peer on the next ask.
                last_error = format!("peer {target} already failed this task");
                continue;
            }

            let mut forwarded = task.clone();
            forwarded.source_peer = Some(endpoint.clone());
            tracing::info!(task_id = %task_id, target = %target, attempt, "forwarding task");

            match self.client.call_peer(&target, &Message::CpuTask { task: forwarded }).await {
                Ok(Message::CpuResult { mut outcome }) => {
                    if outcome.executed_by.is_none() {
                        outcome.executed_by = Some(target.to_string());
                    }
                    let status = if outcome.is_success() { TaskStatus::Completed } else { TaskStatus::Failed };
                    let mut entry = HistoryEntry::new(&task_id, status, Role::Requester);
                    entry.executed_by = outcome.executed_by.clone();
                    entry.requested_by = Some(endpoint.clone());
                    entry.error = outcome.error.clone();
                    if let Some(value) = &outcome.result {
                        entry = entry.with_result(value);
                    }
                    self.history.record(entry);
                    return outcome;
                }
                Ok(Message::Error { error, kind }) => {
                    let mut entry = HistoryEntry::new(&task_id, TaskStatus::Failed, Role::Requester);
                    entry.error = Some(error.clone());
                    entry.requested_by = Some(endpoint.clone());
                    self.history.record(entry);
                    let mut result = TaskResult::failure(task_id, kind, error);
                    result.executed_by = Some(target.to_string());
                    return result;
                }
                Ok(other) => {
                    last_error = format!("unexpected {} reply from {target}", other.kind_name());
                    failed.push(target);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(task_id = %task_id, target = %target, error = %last_error, "forward failed");
                    failed.push(target);
                }
            }
        }

        let message = format!("dispatch failed after {attempts} attempts: {last_error}");
        let mut entry = HistoryEntry::new(&task_id, TaskStatus::Failed, Role::Requester);
        entry.error = Some(message.clone());
        entry.requested_by = Some(endpoint);
        self.history.record(entry);
        TaskResult::failure(task_id, ErrorKind::Transport, message)
    }

    /// Batch submissions preserve arrival order and fail member-wise.
    pub async fn handle_batch(self: &Arc<Self>, tasks: Vec<TaskSpec>) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(self.handle_cpu_task(task).await);
        }
        results
    }

    /// Composite status: each subsystem contributes its own snapshot; no two
    /// subsystem locks are held at once.
    pub async fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "identity": self.identity,
            "address": self.endpoint(),
            "scheduler": self.scheduler.stats(),
            "memory": self.memory.stats(),
            "storage": self.files.stats().await,
            "owned_storage": self.owned.stats(),
            "cache": self.cache.stats(),
            "task_history": self.history.statistics(),
            "quota": self.quota.usage(),
            "process_manager": self.processes.statistics(),
            "resource_arbiter": self.resources.status(),
            "memory_manager": self.allocator.fragmentation(),
            "ipc": self.ipc.statistics(),
        })
    }
}
