//! The peer directory and the public file-advertisement directory.
//!
//! Peers are keyed by their stable identity; addresses are mutable. A peer
//! whose heartbeat goes stale is evicted by the janitor, which also removes
//! it from file advertisements — ownership records live elsewhere and
//! survive peer absence.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use weft_protocol::{PeerAddr, PeerId};

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: PeerId,
    pub address: PeerAddr,
    pub load: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl PeerRecord {
    fn is_alive(&self, timeout: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_heartbeat);
        age.num_milliseconds() < timeout.as_millis() as i64
    }
}

pub struct Registry {
    peer_timeout: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    peers: HashMap<PeerId, PeerRecord>,
    /// filename → identities currently advertising it
    files: HashMap<String, HashSet<PeerId>>,
}

impl Registry {
    pub fn new(peer_timeout: Duration) -> Self {
        Self {
            peer_timeout,
            inner: Mutex::new(Inner { peers: HashMap::new(), files: HashMap::new() }),
        }
    }

    /// Upsert a peer record. Returns the previous address when the identity
    /// re-registered from somewhere else.
    pub fn register(&self, identity: &str, address: PeerAddr, load: f64) -> Option<PeerAddr> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if !inner.peers.contains_key(identity) {
            tracing::info!(identity, address = %address, load, "new peer registered");
            inner.peers.insert(
                identity.to_string(),
                PeerRecord {
                    identity: identity.to_string(),
                    address,
                    load,
                    last_heartbeat: now,
                    registered_at: now,
                },
            );
            return None;
        }
        let record = inner.peers.get_mut(identity).expect("checked above");
        let old = (record.address != address).then(|| record.address.clone());
        if let Some(old_addr) = &old {
            tracing::info!(identity, old = %old_addr, new = %address, "peer address changed");
        }
        record.address = address;
        record.load = load;
        record.last_heartbeat = now;
        old
    }

    /// Returns true if the identity was known.
    pub fn unregister(&self, identity: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let known = inner.peers.remove(identity).is_some();
        if known {
            Self::drop_advertisements(&mut inner, identity);
            tracing::info!(identity, "peer unregistered");
        }
        known
    }

    /// Refresh load and heartbeat. Unknown identities are rejected; the peer
    /// re-registers on its next heartbeat tick.
    pub fn update_load(&self, identity: &str, load: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.peers.get_mut(identity) {
            Some(record) => {
                record.load = load;
                record.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Current address of a live peer.
    pub fn address_of(&self, identity: &str) -> Option<PeerAddr> {
        let inner = self.inner.lock().unwrap();
        inner.peers.get(identity).map(|r| r.address.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    /// The fresh peer with the lowest load; ties go to the earliest
    /// registration. `exclude` removes the requester itself.
    pub fn best_peer(&self, exclude: Option<&str>) -> Option<PeerRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .peers
            .values()
            .filter(|r| r.is_alive(self.peer_timeout))
            .filter(|r| Some(r.identity.as_str()) != exclude)
            .min_by(|a, b| {
                a.load
                    .partial_cmp(&b.load)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.registered_at.cmp(&b.registered_at))
            })
            .cloned()
    }

    pub fn register_file(&self, identity: &str, filename: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.peers.contains_key(identity) {
            return false;
        }
        inner
            .files
            .entry(filename.to_string())
            .or_default()
            .insert(identity.to_string());
        true
    }

    pub fn unregister_file(&self, identity: &str, filename: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(holders) = inner.files.get_mut(filename) {
            holders.remove(identity);
            if holders.is_empty() {
                inner.files.remove(filename);
            }
        }
    }

    /// Addresses of live peers advertising `filename`.
    pub fn find_file(&self, filename: &str) -> Vec<PeerAddr> {
        let inner = self.inner.lock().unwrap();
        let mut addresses: Vec<PeerAddr> = inner
            .files
            .get(filename)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.peers.get(id))
            .filter(|r| r.is_alive(self.peer_timeout))
            .map(|r| r.address.clone())
            .collect();
        addresses.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        addresses
    }

    /// Evict peers whose heartbeat went stale; returns the evicted ids.
    /// Only the peer table and advertisements are touched — ownership
    /// records survive peer absence.
    pub fn evict_stale(&self) -> Vec<PeerId> {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<PeerId> = inner
            .peers
            .values()
            .filter(|r| !r.is_alive(self.peer_timeout))
            .map(|r| r.identity.clone())
            .collect();
        for identity in &stale {
            inner.peers.remove(identity);
            Self::drop_advertisements(&mut inner, identity);
            tracing::info!(identity = %identity, "evicted stale peer");
        }
        stale
    }

    fn drop_advertisements(inner: &mut Inner, identity: &str) {
        inner.files.retain(|_, holders| {
            holders.remove(identity);
            !holders.is_empty()
        });
    }

    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "peer_count": inner.peers.len(),
            "peers": inner.peers.values().map(|r| serde_json::json!({
                "identity": r.identity,
                "address": r.address,
                "load": r.load,
                "last_heartbeat": r.last_heartbeat.to_rfc3339(),
                "registered_at": r.registered_at.to_rfc3339(),
            })).collect::<Vec<_>>(),
            "advertised_files": inner.files.len(),
        })
    }
}
