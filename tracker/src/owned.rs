//! The persistent owned-file registry.
//!
//! One JSON document maps each filename to its owner (by stable identity),
//! the owner's last known address, and the storage peers holding the blob.
//! Every mutation is written through to disk atomically (temp file + rename)
//! while the registry lock is held, so the on-disk image never trails by
//! more than one mutation. Legacy documents that predate stable identities
//! are upgraded on load.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use weft_protocol::{ErrorKind, PeerAddr, PeerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedFileEntry {
    pub owner_id: PeerId,
    pub owner_address: PeerAddr,
    pub storage: Vec<PeerAddr>,
}

/// On-disk entry: either the current form or the historical
/// `[owner_address, [storage_address, ...]]` pair keyed only by address.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Current(OwnedFileEntry),
    Legacy((PeerAddr, Vec<PeerAddr>)),
}

pub fn legacy_owner_id(port: u16) -> String {
    format!("legacy:{port}")
}

pub struct OwnedRegistry {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, OwnedFileEntry>>,
}

impl OwnedRegistry {
    /// Load the registry, normalizing any legacy entries. A missing file is
    /// an empty registry; an unreadable one is a fatal startup error (better
    /// than silently forgetting ownership).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => {
                let stored: BTreeMap<String, StoredEntry> = serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing owned-file registry {}", path.display()))?;
                let mut entries = BTreeMap::new();
                for (filename, entry) in stored {
                    let entry = match entry {
                        StoredEntry::Current(entry) => entry,
                        StoredEntry::Legacy((owner_address, storage)) => {
                            tracing::info!(filename = %filename, "upgrading legacy ownership entry");
                            OwnedFileEntry {
                                owner_id: legacy_owner_id(owner_address.port),
                                owner_address,
                                storage,
                            }
                        }
                    };
                    entries.insert(filename, entry);
                }
                tracing::info!(files = entries.len(), path = %path.display(), "owned-file registry loaded");
                entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading owned-file registry {}", path.display()))
            }
        };
        let registry = Self { path, inner: Mutex::new(entries) };
        // Rewrite immediately so upgraded legacy entries hit the disk.
        let guard = registry.inner.lock().await;
        registry.persist(&guard).await?;
        drop(guard);
        Ok(registry)
    }

    /// Atomic write-through: serialize, write a temp file, rename over the
    /// old document. Called with the registry lock held.
    async fn persist(&self, entries: &BTreeMap<String, OwnedFileEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }

    /// Create-or-union an ownership record and persist it.
    pub async fn register(
        &self,
        filename: &str,
        owner_id: &str,
        owner_address: PeerAddr,
        storage_address: PeerAddr,
    ) -> Result<()> {
        let mut entries = self.inner.lock().await;
        let entry = entries.entry(filename.to_string()).or_insert_with(|| OwnedFileEntry {
            owner_id: owner_id.to_string(),
            owner_address: owner_address.clone(),
            storage: Vec::new(),
        });
        if entry.owner_id != owner_id {
            // A legacy placeholder matching the registrant's port upgrades in
            // place; anything else is a conflicting claim.
            if entry.owner_id == legacy_owner_id(owner_address.port) {
                tracing::info!(filename, owner = owner_id, "legacy owner upgraded to stable identity");
                entry.owner_id = owner_id.to_string();
            } else {
                anyhow::bail!("{filename} is already owned by {}", entry.owner_id);
            }
        }
        entry.owner_address = owner_address;
        if !entry.storage.contains(&storage_address) {
            entry.storage.push(storage_address);
        }
        tracing::info!(filename, owner = owner_id, replicas = entry.storage.len(), "ownership recorded");
        self.persist(&entries).await
    }

    /// Storage addresses, released only to the registered owner.
    pub async fn find(&self, filename: &str, requester_id: &str) -> Result<Vec<PeerAddr>, (ErrorKind, String)> {
        let entries = self.inner.lock().await;
        let entry = entries
            .get(filename)
            .ok_or_else(|| (ErrorKind::UnknownFile, format!("no ownership record for {filename}")))?;
        if entry.owner_id != requester_id {
            return Err((
                ErrorKind::NotOwner,
                format!("{requester_id} does not own {filename}"),
            ));
        }
        Ok(entry.storage.clone())
    }

    /// Remove the record once every storage peer confirmed deletion.
    pub async fn delete(&self, filename: &str, requester_id: &str) -> Result<Result<(), (ErrorKind, String)>> {
        let mut entries = self.inner.lock().await;
        match entries.get(filename) {
            None => return Ok(Err((ErrorKind::UnknownFile, format!("no ownership record for {filename}")))),
            Some(entry) if entry.owner_id != requester_id => {
                return Ok(Err((
                    ErrorKind::NotOwner,
                    format!("{requester_id} does not own {filename}"),
                )));
            }
            Some(_) => {}
        }
        entries.remove(filename);
        tracing::info!(filename, "ownership record deleted");
        self.persist(&entries).await?;
        Ok(Ok(()))
    }

    /// Called on every REGISTER: refresh the owner address of every entry
    /// owned by `identity`, and upgrade legacy placeholders whose port
    /// matches the registrant.
    pub async fn on_peer_registered(&self, identity: &str, address: &PeerAddr) -> Result<()> {
        let mut entries = self.inner.lock().await;
        let placeholder = legacy_owner_id(address.port);
        let mut changed = false;
        for (filename, entry) in entries.iter_mut() {
            if entry.owner_id == placeholder {
                tracing::info!(filename = %filename, owner = identity, "legacy owner upgraded on register");
                entry.owner_id = identity.to_string();
                entry.owner_address = address.clone();
                changed = true;
            } else if entry.owner_id == identity && entry.owner_address != *address {
                tracing::info!(filename = %filename, owner = identity, address = %address, "owner address migrated");
                entry.owner_address = address.clone();
                changed = true;
            }
        }
        if changed {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    pub async fn entry(&self, filename: &str) -> Option<OwnedFileEntry> {
        self.inner.lock().await.get(filename).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerAddr {
        PeerAddr::new("10.0.0.1", port)
    }

    async fn fresh(dir: &std::path::Path) -> OwnedRegistry {
        OwnedRegistry::load(dir.join("owned_files.json")).await.unwrap()
    }

    #[tokio::test]
    async fn register_find_delete_with_authorization() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = fresh(tmp.path()).await;
        registry.register("doc", "owner-1", addr(9000), addr(9100)).await.unwrap();
        registry.register("doc", "owner-1", addr(9000), addr(9200)).await.unwrap();

        let storage = registry.find("doc", "owner-1").await.unwrap();
        assert_eq!(storage, vec![addr(9100), addr(9200)]);

        assert!(matches!(
            registry.find("doc", "intruder").await,
            Err((ErrorKind::NotOwner, _))
        ));
        assert!(matches!(
            registry.find("ghost", "owner-1").await,
            Err((ErrorKind::UnknownFile, _))
        ));

        assert!(matches!(
            registry.delete("doc", "intruder").await.unwrap(),
            Err((ErrorKind::NotOwner, _))
        ));
        registry.delete("doc", "owner-1").await.unwrap().unwrap();
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn registry_survives_restart_byte_for_byte() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let registry = fresh(tmp.path()).await;
            registry.register("doc", "owner-1", addr(9000), addr(9100)).await.unwrap();
        }
        let reloaded = fresh(tmp.path()).await;
        let entry = reloaded.entry("doc").await.unwrap();
        assert_eq!(entry.owner_id, "owner-1");
        assert_eq!(entry.owner_address, addr(9000));
        assert_eq!(entry.storage, vec![addr(9100)]);
    }

    #[tokio::test]
    async fn legacy_entries_are_upgraded_on_load_and_register() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("owned_files.json");
        let legacy = serde_json::json!({
            "doc": [["10.0.0.1", 9000], [["10.0.0.1", 9100]]],
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&legacy).unwrap())
            .await
            .unwrap();

        let registry = OwnedRegistry::load(path).await.unwrap();
        let entry = registry.entry("doc").await.unwrap();
        assert_eq!(entry.owner_id, "legacy:9000");
        assert_eq!(entry.storage, vec![addr(9100)]);

        // A REGISTER whose port matches the placeholder claims the entry.
        registry.on_peer_registered("real-id", &addr(9000)).await.unwrap();
        let entry = registry.entry("doc").await.unwrap();
        assert_eq!(entry.owner_id, "real-id");
        assert_eq!(registry.find("doc", "real-id").await.unwrap(), vec![addr(9100)]);
    }

    #[tokio::test]
    async fn owner_address_follows_re_registration() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = fresh(tmp.path()).await;
        registry.register("doc", "owner-1", addr(9000), addr(9100)).await.unwrap();

        let new_home = PeerAddr::new("10.0.0.2", 9555);
        registry.on_peer_registered("owner-1", &new_home).await.unwrap();
        assert_eq!(registry.entry("doc").await.unwrap().owner_address, new_home);

        // Unrelated identities leave the entry alone.
        registry.on_peer_registered("someone-else", &addr(9777)).await.unwrap();
        assert_eq!(registry.entry("doc").await.unwrap().owner_id, "owner-1");
    }

    #[tokio::test]
    async fn conflicting_ownership_claim_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = fresh(tmp.path()).await;
        registry.register("doc", "owner-1", addr(9000), addr(9100)).await.unwrap();
        assert!(registry
            .register("doc", "owner-2", addr(9001), addr(9100))
            .await
            .is_err());
    }
}
