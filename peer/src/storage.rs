//! Blob storage: public files this peer advertises, and encrypted files held
//! on behalf of other peers.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use weft_protocol::{ErrorKind, PeerAddr, PeerId};

/// Strip any directory components; reject empty and dot names.
fn sanitize(filename: &str) -> Result<String, ErrorKind> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if name.is_empty() || name == "." || name == ".." {
        return Err(ErrorKind::BadRequest);
    }
    Ok(name.to_string())
}

/// Named blob store for files owned by this peer (publicly advertised).
pub struct FileStorage {
    dir: PathBuf,
    operation_count: Mutex<u64>,
}

impl FileStorage {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating storage dir {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), "file storage ready");
        Ok(Self { dir, operation_count: Mutex::new(0) })
    }

    fn bump(&self) {
        *self.operation_count.lock().unwrap() += 1;
    }

    pub async fn put(&self, filename: &str, data: &[u8]) -> Result<(), ErrorKind> {
        let name = sanitize(filename)?;
        tokio::fs::write(self.dir.join(&name), data).await.map_err(|e| {
            tracing::error!(filename = %name, error = %e, "file put failed");
            ErrorKind::Fatal
        })?;
        self.bump();
        tracing::info!(filename = %name, bytes = data.len(), "file put");
        Ok(())
    }

    pub async fn get(&self, filename: &str) -> Result<Option<Vec<u8>>, ErrorKind> {
        let name = sanitize(filename)?;
        match tokio::fs::read(self.dir.join(&name)).await {
            Ok(data) => {
                self.bump();
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                tracing::error!(filename = %name, error = %e, "file get failed");
                Err(ErrorKind::Fatal)
            }
        }
    }

    pub async fn size(&self, filename: &str) -> Result<Option<u64>, ErrorKind> {
        let name = sanitize(filename)?;
        match tokio::fs::metadata(self.dir.join(&name)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => Err(ErrorKind::Fatal),
        }
    }

    /// Read `len` bytes at `offset`; short reads past EOF return what exists.
    pub async fn read_chunk(&self, filename: &str, offset: u64, len: u64) -> Result<Option<Vec<u8>>, ErrorKind> {
        let name = sanitize(filename)?;
        let mut file = match tokio::fs::File::open(self.dir.join(&name)).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(_) => return Err(ErrorKind::Fatal),
        };
        file.seek(SeekFrom::Start(offset)).await.map_err(|_| ErrorKind::Fatal)?;
        let mut buf = vec![0u8; len as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).await.map_err(|_| ErrorKind::Fatal)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        self.bump();
        Ok(Some(buf))
    }

    /// Returns true if the file existed.
    pub async fn delete(&self, filename: &str) -> Result<bool, ErrorKind> {
        let name = sanitize(filename)?;
        match tokio::fs::remove_file(self.dir.join(&name)).await {
            Ok(()) => {
                self.bump();
                tracing::info!(filename = %name, "file delete");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(_) => Err(ErrorKind::Fatal),
        }
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }

    pub async fn stats(&self) -> serde_json::Value {
        let mut file_count = 0u64;
        let mut total_size = 0u64;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file() {
                        file_count += 1;
                        total_size += meta.len();
                    }
                }
            }
        }
        serde_json::json!({
            "file_count": file_count,
            "total_size": total_size,
            "operation_count": *self.operation_count.lock().unwrap(),
            "storage_dir": self.dir.display().to_string(),
        })
    }
}

/// Metadata written next to the blobs of one owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerMeta {
    pub owner_id: PeerId,
    pub owner_address: PeerAddr,
}

const OWNER_META: &str = "owner.json";

/// Blob store for files this peer holds **on behalf of other peers**.
///
/// Each owner gets a subdirectory named `<host>_<port>_<id8>` (`id8` = first
/// eight characters of the owner id) containing the ciphertext blobs and an
/// `owner.json` with the authoritative owner identity. The in-memory index is
/// rebuilt from disk on startup, so ownership survives peer restarts.
pub struct OwnedStorage {
    dir: PathBuf,
    index: Mutex<HashMap<String, OwnerEntry>>,
}

#[derive(Debug, Clone)]
struct OwnerEntry {
    meta: OwnerMeta,
    dir: PathBuf,
}

impl OwnedStorage {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating owned storage dir {}", dir.display()))?;
        let storage = Self { dir, index: Mutex::new(HashMap::new()) };
        storage.reconstruct().await;
        Ok(storage)
    }

    fn owner_dir(&self, meta: &OwnerMeta) -> PathBuf {
        let id8: String = meta.owner_id.chars().take(8).collect();
        self.dir.join(format!("{}_{}_{}", meta.owner_address.host, meta.owner_address.port, id8))
    }

    /// Rebuild the filename → owner index from the on-disk layout.
    pub async fn reconstruct(&self) {
        let mut rebuilt: HashMap<String, OwnerEntry> = HashMap::new();
        let mut dirs = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = dirs.next_entry().await {
            let subdir = entry.path();
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let meta: OwnerMeta = match tokio::fs::read(subdir.join(OWNER_META)).await {
                Ok(raw) => match serde_json::from_slice(&raw) {
                    Ok(meta) => meta,
                    Err(e) => {
                        tracing::warn!(dir = %subdir.display(), error = %e, "unreadable owner metadata, skipping");
                        continue;
                    }
                },
                Err(_) => continue,
            };
            let mut files = match tokio::fs::read_dir(&subdir).await {
                Ok(f) => f,
                Err(_) => continue,
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let name = match file.file_name().into_string() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                if name == OWNER_META {
                    continue;
                }
                rebuilt.insert(name, OwnerEntry { meta: meta.clone(), dir: subdir.clone() });
            }
        }
        let count = rebuilt.len();
        *self.index.lock().unwrap() = rebuilt;
        if count > 0 {
            tracing::info!(files = count, "reconstructed owned storage index");
        }
    }

    pub async fn store(&self, filename: &str, ciphertext: &[u8], meta: OwnerMeta) -> Result<(), ErrorKind> {
        let name = sanitize(filename)?;
        let dir = self.owner_dir(&meta);
        tokio::fs::create_dir_all(&dir).await.map_err(|_| ErrorKind::Fatal)?;
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|_| ErrorKind::Fatal)?;
        tokio::fs::write(dir.join(OWNER_META), meta_json).await.map_err(|_| ErrorKind::Fatal)?;
        tokio::fs::write(dir.join(&name), ciphertext).await.map_err(|_| ErrorKind::Fatal)?;
        self.index.lock().unwrap().insert(name.clone(), OwnerEntry { meta: meta.clone(), dir });
        tracing::info!(filename = %name, owner = %meta.owner_id, bytes = ciphertext.len(), "stored owned file");
        Ok(())
    }

    /// Return the ciphertext if `requester_id` is the registered owner.
    pub async fn fetch(&self, filename: &str, requester_id: &str) -> Result<Vec<u8>, ErrorKind> {
        let name = sanitize(filename)?;
        let entry = self.lookup(&name).await.ok_or(ErrorKind::UnknownFile)?;
        if entry.meta.owner_id != requester_id {
            tracing::warn!(filename = %name, requester = requester_id, "owned file access denied");
            return Err(ErrorKind::NotOwner);
        }
        tokio::fs::read(entry.dir.join(&name)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::UnknownFile
            } else {
                ErrorKind::Fatal
            }
        })
    }

    /// Remove the blob if `requester_id` is the registered owner.
    /// Returns the number of bytes freed.
    pub async fn remove(&self, filename: &str, requester_id: &str) -> Result<u64, ErrorKind> {
        let name = sanitize(filename)?;
        let entry = self.lookup(&name).await.ok_or(ErrorKind::UnknownFile)?;
        if entry.meta.owner_id != requester_id {
            return Err(ErrorKind::NotOwner);
        }
        let path = entry.dir.join(&name);
        let freed = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        tokio::fs::remove_file(&path).await.map_err(|_| ErrorKind::Fatal)?;
        self.index.lock().unwrap().remove(&name);
        tracing::info!(filename = %name, owner = requester_id, "removed owned file");
        Ok(freed)
    }

    async fn lookup(&self, name: &str) -> Option<OwnerEntry> {
        if let Some(entry) = self.index.lock().unwrap().get(name).cloned() {
            return Some(entry);
        }
        // Restarted peers may not have indexed the disk yet.
        self.reconstruct().await;
        self.index.lock().unwrap().get(name).cloned()
    }

    pub fn holds(&self, filename: &str) -> bool {
        self.index.lock().unwrap().contains_key(filename)
    }

    /// All (filename, owner) pairs, for re-reporting to the tracker.
    pub fn entries(&self) -> Vec<(String, OwnerMeta)> {
        self.index
            .lock()
            .unwrap()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.meta.clone()))
            .collect()
    }

    pub fn stats(&self) -> serde_json::Value {
        let index = self.index.lock().unwrap();
        serde_json::json!({
            "file_count": index.len(),
            "owners": index
                .values()
                .map(|e| e.meta.owner_id.clone())
                .collect::<std::collections::BTreeSet<_>>()
                .len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).await.unwrap();
        storage.put("doc.bin", b"hello").await.unwrap();
        assert_eq!(storage.get("doc.bin").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(storage.size("doc.bin").await.unwrap(), Some(5));
        assert!(storage.delete("doc.bin").await.unwrap());
        assert_eq!(storage.get("doc.bin").await.unwrap(), None);
        assert!(!storage.delete("doc.bin").await.unwrap());
    }

    #[tokio::test]
    async fn filenames_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).await.unwrap();
        storage.put("../../etc/passwd", b"x").await.unwrap();
        assert_eq!(storage.list().await, vec!["passwd".to_string()]);
        assert!(matches!(storage.put("..", b"x").await, Err(ErrorKind::BadRequest)));
    }

    #[tokio::test]
    async fn chunked_reads_cover_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).await.unwrap();
        let data: Vec<u8> = (0..=255u8).collect();
        storage.put("blob", &data).await.unwrap();
        let first = storage.read_chunk("blob", 0, 100).await.unwrap().unwrap();
        let second = storage.read_chunk("blob", 100, 100).await.unwrap().unwrap();
        let tail = storage.read_chunk("blob", 200, 100).await.unwrap().unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(tail.len(), 56);
        let mut joined = first;
        joined.extend(second);
        joined.extend(tail);
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn owned_storage_enforces_ownership() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = OwnedStorage::open(tmp.path()).await.unwrap();
        let meta = OwnerMeta {
            owner_id: "owner-1".into(),
            owner_address: PeerAddr::new("10.0.0.1", 9000),
        };
        storage.store("secret.bin", b"ciphertext", meta).await.unwrap();

        assert_eq!(storage.fetch("secret.bin", "owner-1").await.unwrap(), b"ciphertext".to_vec());
        assert!(matches!(
            storage.fetch("secret.bin", "intruder").await,
            Err(ErrorKind::NotOwner)
        ));
        assert!(matches!(
            storage.fetch("missing.bin", "owner-1").await,
            Err(ErrorKind::UnknownFile)
        ));
    }

    #[tokio::test]
    async fn owned_index_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let storage = OwnedStorage::open(tmp.path()).await.unwrap();
            let meta = OwnerMeta {
                owner_id: "owner-2".into(),
                owner_address: PeerAddr::new("10.0.0.2", 9001),
            };
            storage.store("kept.bin", b"data", meta).await.unwrap();
        }
        let reopened = OwnedStorage::open(tmp.path()).await.unwrap();
        assert!(reopened.holds("kept.bin"));
        assert_eq!(reopened.fetch("kept.bin", "owner-2").await.unwrap(), b"data".to_vec());
        let entries = reopened.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.owner_address.port, 9001);
    }
}
