//! Tracker request handling: one framed request per connection, routed over
//! the peer directory and the owned-file registry.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};

use weft_protocol::{wire, ErrorKind, Message};

use crate::owned::OwnedRegistry;
use crate::registry::Registry;

pub struct Tracker {
    pub registry: Registry,
    pub owned: OwnedRegistry,
    pub max_frame_bytes: usize,
}

pub async fn serve(tracker: Arc<Tracker>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let tracker = tracker.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(tracker, stream).await {
                tracing::debug!(remote = %remote, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(tracker: Arc<Tracker>, mut stream: TcpStream) -> Result<()> {
    let msg = match wire::read_message(&mut stream, tracker.max_frame_bytes).await {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable request frame");
            return Ok(());
        }
    };
    tracing::debug!(message_type = msg.kind_name(), "request");
    let response = dispatch(&tracker, msg).await;
    wire::write_message(&mut stream, &response).await?;
    Ok(())
}

pub async fn dispatch(tracker: &Tracker, msg: Message) -> Message {
    match msg {
        Message::Register { identity, address, load } => {
            tracker.registry.register(&identity, address.clone(), load);
            // Ownership follows the identity to its new address, and legacy
            // placeholder owners matching this port upgrade to the identity.
            if let Err(e) = tracker.owned.on_peer_registered(&identity, &address).await {
                tracing::error!(error = %e, "persisting owner migration failed");
                return Message::error(ErrorKind::Fatal, "owned-file registry write failed");
            }
            Message::ok_with(json!({ "peer_count": tracker.registry.peer_count() }))
        }
        Message::Unregister { identity } => {
            if tracker.registry.unregister(&identity) {
                Message::ok()
            } else {
                Message::error(ErrorKind::BadRequest, format!("unknown peer identity: {identity}"))
            }
        }
        Message::UpdateLoad { identity, load } => {
            if tracker.registry.update_load(&identity, load) {
                Message::ok()
            } else {
                Message::error(ErrorKind::BadRequest, format!("unknown peer identity: {identity}"))
            }
        }
        Message::RequestBestPeer { identity, exclude_self } => {
            let exclude = exclude_self.then_some(identity.as_str());
            match tracker.registry.best_peer(exclude) {
                Some(record) => {
                    tracing::info!(selected = %record.identity, load = record.load, "best peer chosen");
                    Message::BestPeer { address: Some(record.address), load: record.load }
                }
                None => Message::BestPeer { address: None, load: 0.0 },
            }
        }
        Message::RegisterFile { identity, filename } => {
            if tracker.registry.register_file(&identity, &filename) {
                Message::ok_with(json!({ "filename": filename }))
            } else {
                Message::error(ErrorKind::BadRequest, format!("unknown peer identity: {identity}"))
            }
        }
        Message::UnregisterFile { identity, filename } => {
            tracker.registry.unregister_file(&identity, &filename);
            Message::ok()
        }
        Message::FindFile { filename } => {
            let addresses = tracker.registry.find_file(&filename);
            Message::FilePeers { filename, addresses }
        }
        Message::RegisterOwnedFile { owner_id, owner_address, storage_identity, filename } => {
            // The storage peer reports right after storing, so it must be
            // registered for its address to be resolvable.
            let Some(storage_address) = tracker.registry.address_of(&storage_identity) else {
                return Message::error(
                    ErrorKind::BadRequest,
                    format!("storage peer {storage_identity} is not registered"),
                );
            };
            match tracker.owned.register(&filename, &owner_id, owner_address, storage_address).await {
                Ok(()) => Message::ok_with(json!({ "filename": filename })),
                Err(e) => Message::error(ErrorKind::BadRequest, e.to_string()),
            }
        }
        Message::FindOwnedFile { filename, requester_id } => {
            match tracker.owned.find(&filename, &requester_id).await {
                Ok(storage_addresses) => Message::OwnedFilePeers { filename, storage_addresses },
                Err((kind, error)) => Message::error(kind, error),
            }
        }
        Message::DeleteOwnedFile { filename, requester_id } => {
            match tracker.owned.delete(&filename, &requester_id).await {
                Ok(Ok(())) => Message::ok_with(json!({ "filename": filename })),
                Ok(Err((kind, error))) => Message::error(kind, error),
                Err(e) => {
                    tracing::error!(error = %e, "persisting ownership delete failed");
                    Message::error(ErrorKind::Fatal, "owned-file registry write failed")
                }
            }
        }
        Message::Status => Message::ok_with(tracker.registry.snapshot()),
        Message::Ping { nonce } => Message::Pong { nonce },
        other => Message::error(
            ErrorKind::BadRequest,
            format!("unsupported message type: {}", other.kind_name()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_protocol::PeerAddr;

    async fn tracker(dir: &std::path::Path, timeout: Duration) -> Tracker {
        Tracker {
            registry: Registry::new(timeout),
            owned: OwnedRegistry::load(dir.join("owned_files.json")).await.unwrap(),
            max_frame_bytes: wire::DEFAULT_MAX_FRAME,
        }
    }

    fn addr(port: u16) -> PeerAddr {
        PeerAddr::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn register_then_best_peer_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = tracker(tmp.path(), Duration::from_secs(30)).await;

        let reply = dispatch(&tracker, Message::Register {
            identity: "A".into(),
            address: addr(9000),
            load: 2.0,
        })
        .await;
        assert!(matches!(reply, Message::Ok { .. }));

        dispatch(&tracker, Message::Register {
            identity: "B".into(),
            address: addr(9001),
            load: 0.5,
        })
        .await;

        let reply = dispatch(&tracker, Message::RequestBestPeer {
            identity: "A".into(),
            exclude_self: false,
        })
        .await;
        match reply {
            Message::BestPeer { address: Some(address), .. } => assert_eq!(address, addr(9001)),
            other => panic!("expected BEST_PEER with address, got {}", other.kind_name()),
        }

        // With only B left to exclude, A remains.
        let reply = dispatch(&tracker, Message::RequestBestPeer {
            identity: "B".into(),
            exclude_self: true,
        })
        .await;
        match reply {
            Message::BestPeer { address: Some(address), .. } => assert_eq!(address, addr(9000)),
            other => panic!("expected BEST_PEER with address, got {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn update_load_for_unknown_identity_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = tracker(tmp.path(), Duration::from_secs(30)).await;
        let reply = dispatch(&tracker, Message::UpdateLoad { identity: "ghost".into(), load: 1.0 }).await;
        assert!(matches!(reply, Message::Error { kind: ErrorKind::BadRequest, .. }));
    }

    #[tokio::test]
    async fn owned_file_flow_with_owner_migration() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = tracker(tmp.path(), Duration::from_secs(30)).await;

        dispatch(&tracker, Message::Register { identity: "owner".into(), address: addr(9000), load: 0.0 }).await;
        dispatch(&tracker, Message::Register { identity: "store".into(), address: addr(9100), load: 0.0 }).await;

        let reply = dispatch(&tracker, Message::RegisterOwnedFile {
            owner_id: "owner".into(),
            owner_address: addr(9000),
            storage_identity: "store".into(),
            filename: "doc".into(),
        })
        .await;
        assert!(matches!(reply, Message::Ok { .. }));

        // Only the owner may discover storage addresses.
        let reply = dispatch(&tracker, Message::FindOwnedFile {
            filename: "doc".into(),
            requester_id: "intruder".into(),
        })
        .await;
        assert!(matches!(reply, Message::Error { kind: ErrorKind::NotOwner, .. }));

        let reply = dispatch(&tracker, Message::FindOwnedFile {
            filename: "doc".into(),
            requester_id: "owner".into(),
        })
        .await;
        match reply {
            Message::OwnedFilePeers { storage_addresses, .. } => {
                assert_eq!(storage_addresses, vec![addr(9100)]);
            }
            other => panic!("expected OWNED_FILE_PEERS, got {}", other.kind_name()),
        }

        // The owner re-registers from a new address; the entry follows it.
        dispatch(&tracker, Message::Register {
            identity: "owner".into(),
            address: PeerAddr::new("10.1.1.1", 9555),
            load: 0.0,
        })
        .await;
        let entry = tracker.owned.entry("doc").await.unwrap();
        assert_eq!(entry.owner_address, PeerAddr::new("10.1.1.1", 9555));

        let reply = dispatch(&tracker, Message::DeleteOwnedFile {
            filename: "doc".into(),
            requester_id: "owner".into(),
        })
        .await;
        assert!(matches!(reply, Message::Ok { .. }));
        assert_eq!(tracker.owned.len().await, 0);
    }

    #[tokio::test]
    async fn unregistered_storage_peer_cannot_report_ownership() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = tracker(tmp.path(), Duration::from_secs(30)).await;
        let reply = dispatch(&tracker, Message::RegisterOwnedFile {
            owner_id: "owner".into(),
            owner_address: addr(9000),
            storage_identity: "nobody".into(),
            filename: "doc".into(),
        })
        .await;
        assert!(matches!(reply, Message::Error { kind: ErrorKind::BadRequest, .. }));
    }

    #[tokio::test]
    async fn eviction_keeps_ownership_but_drops_advertisements() {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = tracker(tmp.path(), Duration::from_millis(0)).await;
        dispatch(&tracker, Message::Register { identity: "A".into(), address: addr(9000), load: 0.0 }).await;
        dispatch(&tracker, Message::RegisterFile { identity: "A".into(), filename: "pub.bin".into() }).await;
        dispatch(&tracker, Message::RegisterOwnedFile {
            owner_id: "owner".into(),
            owner_address: addr(9000),
            storage_identity: "A".into(),
            filename: "doc".into(),
        })
        .await;

        tracker.registry.evict_stale();

        let reply = dispatch(&tracker, Message::FindFile { filename: "pub.bin".into() }).await;
        match reply {
            Message::FilePeers { addresses, .. } => assert!(addresses.is_empty()),
            other => panic!("expected FILE_PEERS, got {}", other.kind_name()),
        }
        // Ownership survives peer absence.
        assert!(tracker.owned.entry("doc").await.is_some());
    }
}
