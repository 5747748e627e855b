//! IPC primitives: bounded message queues and counting semaphores with FIFO
//! waiter lists.
//!
//! A WAIT that finds the semaphore exhausted parks the *simulated* pid in the
//! waiter list and reports BLOCKED; the TCP connection that delivered it never
//! suspends. Queue receives may await arrival up to a caller timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use weft_protocol::ErrorKind;

#[derive(Debug, Clone, Serialize)]
pub struct IpcMessage {
    pub message_id: String,
    pub sender: String,
    pub receiver: String,
    pub data: Value,
    pub sent_at: DateTime<Utc>,
}

pub struct MessageQueue {
    queue_id: String,
    capacity: usize,
    created_at: DateTime<Utc>,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    messages: VecDeque<IpcMessage>,
    sent_count: u64,
}

impl MessageQueue {
    fn new(queue_id: String, capacity: usize) -> Self {
        Self {
            queue_id,
            capacity,
            created_at: Utc::now(),
            inner: Mutex::new(QueueInner { messages: VecDeque::new(), sent_count: 0 }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a message; a full queue is reported to the caller, never
    /// silently dropped.
    pub fn send(&self, sender: &str, receiver: &str, data: Value) -> Result<String, (ErrorKind, String)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.messages.len() >= self.capacity {
            tracing::warn!(queue = %self.queue_id, "queue full");
            return Err((
                ErrorKind::ExceedsAvailable,
                format!("queue {} is full ({} messages)", self.queue_id, self.capacity),
            ));
        }
        let message_id = format!("MSG{}", inner.sent_count);
        inner.sent_count += 1;
        inner.messages.push_back(IpcMessage {
            message_id: message_id.clone(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            data,
            sent_at: Utc::now(),
        });
        drop(inner);
        self.notify.notify_waiters();
        Ok(message_id)
    }

    fn try_take(&self, receiver: &str) -> Option<IpcMessage> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner
            .messages
            .iter()
            .position(|m| m.receiver == receiver || m.receiver == "*")?;
        inner.messages.remove(position)
    }

    /// Take the oldest message addressed to `receiver` (or broadcast),
    /// waiting up to `timeout` for one to arrive.
    pub async fn receive(&self, receiver: &str, timeout: Option<Duration>) -> Option<IpcMessage> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before the availability check so a send
            // landing in between is not missed.
            let _ = notified.as_mut().enable();
            if let Some(message) = self.try_take(receiver) {
                return Some(message);
            }
            match deadline {
                None => return None,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    if tokio::time::timeout(remaining, &mut notified).await.is_err() {
                        return self.try_take(receiver);
                    }
                }
            }
        }
    }

    pub fn statistics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "queue_id": self.queue_id,
            "size": inner.messages.len(),
            "capacity": self.capacity,
            "sent_count": inner.sent_count,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Acquired(i64),
    Blocked(i64),
}

pub struct Semaphore {
    sem_id: String,
    created_at: DateTime<Utc>,
    inner: Mutex<SemInner>,
}

struct SemInner {
    value: i64,
    waiters: VecDeque<String>,
    operations: u64,
}

impl Semaphore {
    fn new(sem_id: String, initial: i64) -> Self {
        Self {
            sem_id,
            created_at: Utc::now(),
            inner: Mutex::new(SemInner { value: initial, waiters: VecDeque::new(), operations: 0 }),
        }
    }

    /// P: decrement; a negative result parks the pid in FIFO order.
    pub fn wait(&self, pid: &str) -> WaitOutcome {
        let mut inner = self.inner.lock().unwrap();
        inner.operations += 1;
        inner.value -= 1;
        if inner.value < 0 {
            inner.waiters.push_back(pid.to_string());
            tracing::debug!(sem = %self.sem_id, pid, value = inner.value, "semaphore blocked");
            WaitOutcome::Blocked(inner.value)
        } else {
            WaitOutcome::Acquired(inner.value)
        }
    }

    /// V: increment; wakes the head waiter if any. Returns (woken, value).
    pub fn signal(&self, pid: &str) -> (Option<String>, i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.operations += 1;
        inner.value += 1;
        let woken = inner.waiters.pop_front();
        if let Some(w) = &woken {
            tracing::debug!(sem = %self.sem_id, woken = %w, by = pid, "semaphore signalled");
        }
        (woken, inner.value)
    }

    pub fn value(&self) -> i64 {
        self.inner.lock().unwrap().value
    }

    pub fn statistics(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "sem_id": self.sem_id,
            "value": inner.value,
            "waiting_processes": inner.waiters.len(),
            "operation_count": inner.operations,
            "created_at": self.created_at.to_rfc3339(),
        })
    }
}

/// Owns both IPC namespaces.
pub struct IpcManager {
    queues: Mutex<HashMap<String, Arc<MessageQueue>>>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl IpcManager {
    pub fn new() -> Self {
        Self { queues: Mutex::new(HashMap::new()), semaphores: Mutex::new(HashMap::new()) }
    }

    /// Returns false if the queue already exists.
    pub fn create_queue(&self, queue_id: &str, capacity: usize) -> bool {
        let mut queues = self.queues.lock().unwrap();
        if queues.contains_key(queue_id) {
            return false;
        }
        queues.insert(queue_id.to_string(), Arc::new(MessageQueue::new(queue_id.to_string(), capacity)));
        tracing::info!(queue = queue_id, capacity, "message queue created");
        true
    }

    pub fn queue(&self, queue_id: &str) -> Option<Arc<MessageQueue>> {
        self.queues.lock().unwrap().get(queue_id).cloned()
    }

    /// Returns false if the semaphore already exists.
    pub fn create_semaphore(&self, sem_id: &str, initial: i64) -> bool {
        let mut semaphores = self.semaphores.lock().unwrap();
        if semaphores.contains_key(sem_id) {
            return false;
        }
        semaphores.insert(sem_id.to_string(), Arc::new(Semaphore::new(sem_id.to_string(), initial)));
        tracing::info!(sem = sem_id, initial, "semaphore created");
        true
    }

    pub fn semaphore(&self, sem_id: &str) -> Option<Arc<Semaphore>> {
        self.semaphores.lock().unwrap().get(sem_id).cloned()
    }

    pub fn statistics(&self) -> Value {
        let queues = self.queues.lock().unwrap();
        let semaphores = self.semaphores.lock().unwrap();
        serde_json::json!({
            "message_queues": queues.iter().map(|(id, q)| (id.clone(), q.statistics())).collect::<HashMap<_, _>>(),
            "semaphores": semaphores.iter().map(|(id, s)| (id.clone(), s.statistics())).collect::<HashMap<_, _>>(),
            "total_queues": queues.len(),
            "total_semaphores": semaphores.len(),
        })
    }
}

impl Default for IpcManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queue_delivers_by_receiver_and_broadcast() {
        let manager = IpcManager::new();
        assert!(manager.create_queue("q", 10));
        assert!(!manager.create_queue("q", 10), "duplicate queue");
        let queue = manager.queue("q").unwrap();

        queue.send("P1", "P2", json!("direct")).unwrap();
        queue.send("P1", "*", json!("broadcast")).unwrap();

        // P3 skips the message addressed to P2 and gets the broadcast.
        let m = queue.receive("P3", None).await.unwrap();
        assert_eq!(m.data, json!("broadcast"));
        let m = queue.receive("P2", None).await.unwrap();
        assert_eq!(m.data, json!("direct"));
        assert!(queue.receive("P2", None).await.is_none());
    }

    #[tokio::test]
    async fn queue_is_bounded() {
        let manager = IpcManager::new();
        manager.create_queue("q", 2);
        let queue = manager.queue("q").unwrap();
        queue.send("a", "*", json!(1)).unwrap();
        queue.send("a", "*", json!(2)).unwrap();
        let (kind, _) = queue.send("a", "*", json!(3)).unwrap_err();
        assert_eq!(kind, ErrorKind::ExceedsAvailable);
    }

    #[tokio::test]
    async fn receive_waits_for_arrival() {
        let manager = IpcManager::new();
        manager.create_queue("q", 4);
        let queue = manager.queue("q").unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive("P1", Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.send("P9", "P1", json!("late")).unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.data, json!("late"));
    }

    #[tokio::test]
    async fn receive_times_out_empty_handed() {
        let manager = IpcManager::new();
        manager.create_queue("q", 4);
        let queue = manager.queue("q").unwrap();
        let got = queue.receive("P1", Some(Duration::from_millis(20))).await;
        assert!(got.is_none());
    }

    #[test]
    fn semaphore_parks_and_wakes_fifo() {
        let sem = Semaphore::new("s".into(), 1);
        assert_eq!(sem.wait("P1"), WaitOutcome::Acquired(0));
        assert_eq!(sem.wait("P2"), WaitOutcome::Blocked(-1));
        assert_eq!(sem.wait("P3"), WaitOutcome::Blocked(-2));

        let (woken, value) = sem.signal("P1");
        assert_eq!(woken.as_deref(), Some("P2"));
        assert_eq!(value, -1);
        let (woken, _) = sem.signal("P2");
        assert_eq!(woken.as_deref(), Some("P3"));
        let (woken, value) = sem.signal("P3");
        assert_eq!(woken, None);
        assert_eq!(value, 1);
    }

    #[test]
    fn ipc_statistics_cover_both_namespaces() {
        let manager = IpcManager::new();
        manager.create_queue("q1", 8);
        manager.create_semaphore("s1", 2);
        assert!(!manager.create_semaphore("s1", 2));
        let stats = manager.statistics();
        assert_eq!(stats["total_queues"], 1);
        assert_eq!(stats["total_semaphores"], 1);
        assert_eq!(stats["semaphores"]["s1"]["value"], 2);
    }
}
