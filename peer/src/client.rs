//! Outbound RPC: the peer as a client towards the tracker and other peers.
//! Every call is a one-shot framed request over a fresh connection.

use std::time::Duration;

use anyhow::{Context, Result};

use weft_protocol::{wire, ErrorKind, Message, PeerAddr, PeerId};

#[derive(Clone)]
pub struct Client {
    tracker: PeerAddr,
    timeout: Duration,
}

impl Client {
    pub fn new(tracker: PeerAddr, timeout: Duration) -> Self {
        Self { tracker, timeout }
    }

    pub fn tracker_addr(&self) -> &PeerAddr {
        &self.tracker
    }

    async fn call_tracker(&self, msg: &Message) -> Result<Message> {
        wire::request(&self.tracker, msg, self.timeout)
            .await
            .with_context(|| format!("tracker {} unreachable", self.tracker))
    }

    /// One-shot call to another peer.
    pub async fn call_peer(&self, addr: &PeerAddr, msg: &Message) -> Result<Message> {
        wire::request(addr, msg, self.timeout)
            .await
            .with_context(|| format!("peer {addr} unreachable"))
    }

    pub async fn register(&self, identity: &str, address: &PeerAddr, load: f64) -> Result<()> {
        let msg = Message::Register {
            identity: identity.to_string(),
            address: address.clone(),
            load,
        };
        match self.call_tracker(&msg).await? {
            Message::Ok { .. } => Ok(()),
            Message::Error { error, .. } => anyhow::bail!("registration rejected: {error}"),
            other => anyhow::bail!("unexpected {} reply to REGISTER", other.kind_name()),
        }
    }

    pub async fn unregister(&self, identity: &str) -> Result<()> {
        let msg = Message::Unregister { identity: identity.to_string() };
        self.call_tracker(&msg).await?;
        Ok(())
    }

    /// Ok(false) means the tracker does not know this identity (it probably
    /// restarted); the caller should re-register.
    pub async fn update_load(&self, identity: &str, load: f64) -> Result<bool> {
        let msg = Message::UpdateLoad { identity: identity.to_string(), load };
        match self.call_tracker(&msg).await? {
            Message::Ok { .. } => Ok(true),
            Message::Error { .. } => Ok(false),
            other => anyhow::bail!("unexpected {} reply to UPDATE_LOAD", other.kind_name()),
        }
    }

    pub async fn request_best_peer(&self, identity: &str, exclude_self: bool) -> Result<Option<PeerAddr>> {
        let msg = Message::RequestBestPeer { identity: identity.to_string(), exclude_self };
        match self.call_tracker(&msg).await? {
            Message::BestPeer { address, .. } => Ok(address),
            Message::Error { error, .. } => anyhow::bail!("best-peer request failed: {error}"),
            other => anyhow::bail!("unexpected {} reply to REQUEST_BEST_PEER", other.kind_name()),
        }
    }

    pub async fn register_file(&self, identity: &str, filename: &str) -> Result<()> {
        let msg = Message::RegisterFile {
            identity: identity.to_string(),
            filename: filename.to_string(),
        };
        self.call_tracker(&msg).await?;
        Ok(())
    }

    pub async fn unregister_file(&self, identity: &str, filename: &str) -> Result<()> {
        let msg = Message::UnregisterFile {
            identity: identity.to_string(),
            filename: filename.to_string(),
        };
        self.call_tracker(&msg).await?;
        Ok(())
    }

    pub async fn find_file(&self, filename: &str) -> Result<Vec<PeerAddr>> {
        let msg = Message::FindFile { filename: filename.to_string() };
        match self.call_tracker(&msg).await? {
            Message::FilePeers { addresses, .. } => Ok(addresses),
            Message::Error { error, .. } => anyhow::bail!("file lookup failed: {error}"),
            other => anyhow::bail!("unexpected {} reply to FIND_FILE", other.kind_name()),
        }
    }

    pub async fn register_owned_file(
        &self,
        owner_id: &str,
        owner_address: &PeerAddr,
        storage_identity: &str,
        filename: &str,
    ) -> Result<()> {
        let msg = Message::RegisterOwnedFile {
            owner_id: owner_id.to_string(),
            owner_address: owner_address.clone(),
            storage_identity: storage_identity.to_string(),
            filename: filename.to_string(),
        };
        match self.call_tracker(&msg).await? {
            Message::Ok { .. } => Ok(()),
            Message::Error { error, .. } => anyhow::bail!("owned-file registration failed: {error}"),
            other => anyhow::bail!("unexpected {} reply to REGISTER_OWNED_FILE", other.kind_name()),
        }
    }

    /// Outer error: transport. Inner error: an authorization or lookup
    /// failure the caller relays to its own client.
    pub async fn find_owned_file(
        &self,
        filename: &str,
        requester_id: &PeerId,
    ) -> Result<Result<Vec<PeerAddr>, (ErrorKind, String)>> {
        let msg = Message::FindOwnedFile {
            filename: filename.to_string(),
            requester_id: requester_id.clone(),
        };
        match self.call_tracker(&msg).await? {
            Message::OwnedFilePeers { storage_addresses, .. } => Ok(Ok(storage_addresses)),
            Message::Error { error, kind } => Ok(Err((kind, error))),
            other => anyhow::bail!("unexpected {} reply to FIND_OWNED_FILE", other.kind_name()),
        }
    }

    pub async fn delete_owned_file(
        &self,
        filename: &str,
        requester_id: &PeerId,
    ) -> Result<Result<(), (ErrorKind, String)>> {
        let msg = Message::DeleteOwnedFile {
            filename: filename.to_string(),
            requester_id: requester_id.clone(),
        };
        match self.call_tracker(&msg).await? {
            Message::Ok { .. } => Ok(Ok(())),
            Message::Error { error, kind } => Ok(Err((kind, error))),
            other => anyhow::bail!("unexpected {} reply to DELETE_OWNED_FILE", other.kind_name()),
        }
    }
}
