//! Task scheduler: one dispatch worker draining a ready set under one of four
//! disciplines (FCFS, SJF, Priority, Round-Robin).
//!
//! Execution is non-preemptive. A per-task timeout abandons the blocking
//! worker thread and reports TIMED_OUT; the callable itself is never
//! interrupted. Cancellation only affects tasks still in the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use weft_protocol::{Discipline, ErrorKind, TaskSpec, TaskStatus};

use crate::executor::TaskRunner;
use crate::os::process::{ProcessState, ProcessTable};
use crate::os::resources::ResourceArbiter;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);
/// Round-Robin quantum. Execution is non-preemptive, so this only feeds the
/// statistics output.
pub const RR_QUANTUM_SECS: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub kind: Option<ErrorKind>,
    pub waiting_secs: f64,
    pub execution_secs: f64,
    pub turnaround_secs: f64,
}

impl TaskOutcome {
    fn completed(result: Value, waiting: f64, execution: f64, turnaround: f64) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            kind: None,
            waiting_secs: waiting,
            execution_secs: execution,
            turnaround_secs: turnaround,
        }
    }

    fn unsuccessful(status: TaskStatus, kind: ErrorKind, error: String, waiting: f64, execution: f64, turnaround: f64) -> Self {
        Self {
            status,
            result: None,
            error: Some(error),
            kind: Some(kind),
            waiting_secs: waiting,
            execution_secs: execution,
            turnaround_secs: turnaround,
        }
    }
}

struct QueuedTask {
    seq: u64,
    spec: TaskSpec,
    enqueued_at: Instant,
    cancel: Arc<AtomicBool>,
    reply: oneshot::Sender<TaskOutcome>,
}

struct Inner {
    discipline: Discipline,
    queue: Vec<QueuedTask>,
    /// Cancel flags for tasks still in the queue.
    cancels: HashMap<String, Arc<AtomicBool>>,
    running: usize,
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    waiting_sum: f64,
    turnaround_sum: f64,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    notify: Notify,
    seq: AtomicU64,
    default_timeout: Duration,
    started_at: Instant,
}

impl Scheduler {
    pub fn new(discipline: Discipline, default_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                discipline,
                queue: Vec::new(),
                cancels: HashMap::new(),
                running: 0,
                submitted: 0,
                completed: 0,
                failed: 0,
                cancelled: 0,
                timed_out: 0,
                waiting_sum: 0.0,
                turnaround_sum: 0.0,
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            default_timeout,
            started_at: Instant::now(),
        }
    }

    /// Enqueue a task; the receiver resolves with the final outcome.
    pub fn submit(&self, spec: TaskSpec) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.submitted += 1;
            inner.cancels.insert(spec.task_id.clone(), cancel.clone());
            inner.queue.push(QueuedTask {
                seq,
                spec,
                enqueued_at: Instant::now(),
                cancel,
                reply: tx,
            });
        }
        self.notify.notify_one();
        rx
    }

    /// Mark a queued task cancelled. Running or finished tasks are untouched.
    pub fn cancel(&self, task_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.cancels.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                tracing::info!(task_id, "task cancelled");
                true
            }
            None => false,
        }
    }

    /// Queue length plus a small weight for whatever is running: the load
    /// figure reported to the tracker.
    pub fn load(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.queue.len() as f64 + 0.5 * inner.running as f64
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.lock().unwrap().discipline
    }

    pub fn set_discipline(&self, discipline: Discipline) {
        let mut inner = self.inner.lock().unwrap();
        inner.discipline = discipline;
        tracing::info!(discipline = %discipline, "scheduling discipline changed");
    }

    pub fn stats(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let ran = inner.completed + inner.failed + inner.timed_out;
        let elapsed = self.started_at.elapsed().as_secs_f64();
        serde_json::json!({
            "algorithm": inner.discipline.as_str(),
            "quantum_secs": RR_QUANTUM_SECS,
            "queue_length": inner.queue.len(),
            "running": inner.running,
            "submitted": inner.submitted,
            "completed": inner.completed,
            "failed": inner.failed,
            "cancelled": inner.cancelled,
            "timed_out": inner.timed_out,
            "average_waiting_time": if ran > 0 { inner.waiting_sum / ran as f64 } else { 0.0 },
            "average_turnaround_time": if ran > 0 { inner.turnaround_sum / ran as f64 } else { 0.0 },
            "throughput": if elapsed > 0.0 { ran as f64 / elapsed } else { 0.0 },
        })
    }

    /// Remove the next task according to the active discipline.
    /// Ties always break by enqueue sequence.
    fn take_next(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.is_empty() {
            return None;
        }
        let index = match inner.discipline {
            Discipline::Fcfs | Discipline::RoundRobin => inner
                .queue
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.seq)
                .map(|(i, _)| i)?,
            Discipline::Sjf => inner
                .queue
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let ea = a.spec.estimated_runtime.unwrap_or(1.0);
                    let eb = b.spec.estimated_runtime.unwrap_or(1.0);
                    ea.partial_cmp(&eb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.seq.cmp(&b.seq))
                })
                .map(|(i, _)| i)?,
            Discipline::Priority => inner
                .queue
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    b.spec
                        .priority
                        .cmp(&a.spec.priority)
                        .then(a.seq.cmp(&b.seq))
                })
                .map(|(i, _)| i)?,
        };
        let task = inner.queue.remove(index);
        inner.cancels.remove(&task.spec.task_id);
        Some(task)
    }

    /// The dispatch worker. Runs until the peer shuts down.
    pub async fn run(
        self: Arc<Self>,
        processes: Arc<ProcessTable>,
        resources: Arc<ResourceArbiter>,
        runner: Arc<dyn TaskRunner>,
    ) {
        loop {
            let notified = self.notify.notified();
            match self.take_next() {
                Some(task) => self.execute(task, &processes, &resources, &runner).await,
                None => notified.await,
            }
        }
    }

    async fn execute(
        &self,
        task: QueuedTask,
        processes: &Arc<ProcessTable>,
        resources: &Arc<ResourceArbiter>,
        runner: &Arc<dyn TaskRunner>,
    ) {
        let QueuedTask { spec, enqueued_at, cancel, reply, .. } = task;
        let task_id = spec.task_id.clone();
        let waiting = enqueued_at.elapsed().as_secs_f64();

        if cancel.load(Ordering::SeqCst) {
            tracing::info!(task_id = %task_id, "dropping cancelled task");
            self.inner.lock().unwrap().cancelled += 1;
            let _ = reply.send(TaskOutcome::unsuccessful(
                TaskStatus::Cancelled,
                ErrorKind::Cancelled,
                "task cancelled before execution".to_string(),
                waiting,
                0.0,
                waiting,
            ));
            return;
        }

        self.inner.lock().unwrap().running += 1;
        let pid = processes.create(
            serde_json::json!({
                "task_id": task_id,
                "function": spec.function,
                "priority": spec.priority,
            }),
            None,
            None,
        );
        processes.set_state(&pid, ProcessState::Ready);
        processes.set_state(&pid, ProcessState::Running);

        // Acquire declared resources; a denial fails the task like any error.
        let mut holds_resources = false;
        let mut denial: Option<(ErrorKind, String)> = None;
        if !spec.resources.is_empty() {
            resources.register_process(&pid, spec.resources.clone());
            holds_resources = true;
            for (name, units) in &spec.resources {
                if let Err(e) = resources.request(&pid, name, *units) {
                    denial = Some(e);
                    break;
                }
            }
        }

        let outcome = if let Some((kind, message)) = denial {
            let turnaround = enqueued_at.elapsed().as_secs_f64();
            TaskOutcome::unsuccessful(TaskStatus::Failed, kind, message, waiting, 0.0, turnaround)
        } else {
            let timeout = spec
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout);
            let started = Instant::now();
            let worker = {
                let runner = runner.clone();
                let spec = spec.clone();
                tokio::task::spawn_blocking(move || runner.run(&spec))
            };
            match tokio::time::timeout(timeout, worker).await {
                Ok(Ok(Ok(value))) => {
                    let execution = started.elapsed().as_secs_f64();
                    let turnaround = enqueued_at.elapsed().as_secs_f64();
                    TaskOutcome::completed(value, waiting, execution, turnaround)
                }
                Ok(Ok(Err(message))) => {
                    let execution = started.elapsed().as_secs_f64();
                    let turnaround = enqueued_at.elapsed().as_secs_f64();
                    tracing::warn!(task_id = %task_id, error = %message, "task failed");
                    TaskOutcome::unsuccessful(TaskStatus::Failed, ErrorKind::TaskFailed, message, waiting, execution, turnaround)
                }
                Ok(Err(join_error)) => {
                    let execution = started.elapsed().as_secs_f64();
                    let turnaround = enqueued_at.elapsed().as_secs_f64();
                    tracing::error!(task_id = %task_id, error = %join_error, "task worker panicked");
                    TaskOutcome::unsuccessful(
                        TaskStatus::Failed,
                        ErrorKind::TaskFailed,
                        format!("task worker panicked: {join_error}"),
                        waiting,
                        execution,
                        turnaround,
                    )
                }
                Err(_) => {
                    // The worker thread is abandoned; its value is discarded.
                    let execution = started.elapsed().as_secs_f64();
                    let turnaround = enqueued_at.elapsed().as_secs_f64();
                    tracing::warn!(task_id = %task_id, timeout_secs = timeout.as_secs_f64(), "task timed out");
                    TaskOutcome::unsuccessful(
                        TaskStatus::TimedOut,
                        ErrorKind::TimedOut,
                        format!("task exceeded its {:.0}s budget", timeout.as_secs_f64()),
                        waiting,
                        execution,
                        turnaround,
                    )
                }
            }
        };

        if holds_resources {
            resources.retire_process(&pid);
        }
        processes.add_cpu_time(&pid, outcome.execution_secs);
        processes.terminate(&pid);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.running -= 1;
            match outcome.status {
                TaskStatus::Completed => inner.completed += 1,
                TaskStatus::Failed => inner.failed += 1,
                TaskStatus::TimedOut => inner.timed_out += 1,
                _ => {}
            }
            inner.waiting_sum += outcome.waiting_secs;
            inner.turnaround_sum += outcome.turnaround_secs;
        }
        tracing::info!(
            task_id = %task_id,
            status = %outcome.status,
            waiting = outcome.waiting_secs,
            turnaround = outcome.turnaround_secs,
            "task finished"
        );
        let _ = reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn harness(discipline: Discipline, timeout: Duration) -> (Arc<Scheduler>, Arc<ProcessTable>, Arc<ResourceArbiter>) {
        (
            Arc::new(Scheduler::new(discipline, timeout)),
            Arc::new(ProcessTable::new()),
            Arc::new(ResourceArbiter::new()),
        )
    }

    fn spawn_loop(
        scheduler: &Arc<Scheduler>,
        processes: &Arc<ProcessTable>,
        resources: &Arc<ResourceArbiter>,
        runner: Arc<dyn TaskRunner>,
    ) {
        tokio::spawn(scheduler.clone().run(processes.clone(), resources.clone(), runner));
    }

    fn spec(id: &str, priority: i64) -> TaskSpec {
        let mut s = TaskSpec::new(id, "f(a) = a + 0", "f", vec![json!(1)]);
        s.priority = priority;
        s
    }

    #[tokio::test]
    async fn completes_a_task_with_timing() {
        let (scheduler, processes, resources) = harness(Discipline::Fcfs, Duration::from_secs(5));
        let rx = scheduler.submit(spec("t1", 0));
        spawn_loop(&scheduler, &processes, &resources, Arc::new(crate::executor::ExprRunner));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.result, Some(json!(1)));
        assert!(outcome.turnaround_secs >= outcome.waiting_secs);
        assert_eq!(scheduler.stats()["completed"], 1);
    }

    #[tokio::test]
    async fn priority_discipline_runs_high_priority_first() {
        let (scheduler, processes, resources) = harness(Discipline::Priority, Duration::from_secs(5));
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let order = order.clone();
            move |task: &TaskSpec| -> Result<Value, String> {
                order.lock().unwrap().push(task.task_id.clone());
                Ok(json!(0))
            }
        };

        let mut receivers = Vec::new();
        for i in 0..20 {
            receivers.push(scheduler.submit(spec(&format!("low{i}"), 0)));
        }
        receivers.push(scheduler.submit(spec("urgent", 100)));

        spawn_loop(&scheduler, &processes, &resources, Arc::new(recorder));
        for rx in receivers {
            rx.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(order[0], "urgent");
        // The equal-priority tail keeps FIFO order.
        let lows: Vec<_> = order.iter().filter(|id| id.starts_with("low")).collect();
        for (i, id) in lows.iter().enumerate() {
            assert_eq!(**id, format!("low{i}"));
        }
    }

    #[tokio::test]
    async fn sjf_picks_shortest_estimate() {
        let (scheduler, processes, resources) = harness(Discipline::Sjf, Duration::from_secs(5));
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let order = order.clone();
            move |task: &TaskSpec| -> Result<Value, String> {
                order.lock().unwrap().push(task.task_id.clone());
                Ok(json!(0))
            }
        };

        let mut long = spec("long", 0);
        long.estimated_runtime = Some(10.0);
        let mut short = spec("short", 0);
        short.estimated_runtime = Some(0.1);
        let rx1 = scheduler.submit(long);
        let rx2 = scheduler.submit(short);

        spawn_loop(&scheduler, &processes, &resources, Arc::new(recorder));
        rx1.await.unwrap();
        rx2.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["short".to_string(), "long".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_queued_task_is_dropped_at_its_turn() {
        let (scheduler, processes, resources) = harness(Discipline::Fcfs, Duration::from_secs(5));
        let rx = scheduler.submit(spec("victim", 0));
        assert!(scheduler.cancel("victim"));
        assert!(!scheduler.cancel("missing"));

        spawn_loop(&scheduler, &processes, &resources, Arc::new(crate::executor::ExprRunner));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.kind, Some(ErrorKind::Cancelled));
        assert_eq!(scheduler.stats()["cancelled"], 1);
        assert_eq!(scheduler.stats()["completed"], 0);
    }

    #[tokio::test]
    async fn timeout_abandons_the_worker() {
        let (scheduler, processes, resources) = harness(Discipline::Fcfs, Duration::from_millis(50));
        let slow = |_: &TaskSpec| -> Result<Value, String> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(json!("too late"))
        };
        let rx = scheduler.submit(spec("slow", 0));
        spawn_loop(&scheduler, &processes, &resources, Arc::new(slow));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::TimedOut);
        assert_eq!(outcome.kind, Some(ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn declared_resources_are_acquired_and_released() {
        let (scheduler, processes, resources) = harness(Discipline::Fcfs, Duration::from_secs(5));
        resources.register_resource("GPU", "DEVICE", 2);

        let mut task = spec("gpu-task", 0);
        task.resources.insert("GPU".to_string(), 2);
        let rx = scheduler.submit(task);
        spawn_loop(&scheduler, &processes, &resources, Arc::new(crate::executor::ExprRunner));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        // Everything returned to the pool once the task finished.
        assert_eq!(resources.status()["resources"]["GPU"]["available"], 2);
    }

    #[tokio::test]
    async fn impossible_resource_need_fails_the_task() {
        let (scheduler, processes, resources) = harness(Discipline::Fcfs, Duration::from_secs(5));
        resources.register_resource("GPU", "DEVICE", 1);
        let mut task = spec("greedy", 0);
        task.resources.insert("GPU".to_string(), 5);
        let rx = scheduler.submit(task);
        spawn_loop(&scheduler, &processes, &resources, Arc::new(crate::executor::ExprRunner));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.kind, Some(ErrorKind::ExceedsAvailable));
    }

    #[tokio::test]
    async fn load_reflects_queue_depth() {
        let (scheduler, _, _) = harness(Discipline::Fcfs, Duration::from_secs(5));
        assert_eq!(scheduler.load(), 0.0);
        let _rx1 = scheduler.submit(spec("a", 0));
        let _rx2 = scheduler.submit(spec("b", 0));
        assert_eq!(scheduler.load(), 2.0);
    }
}
