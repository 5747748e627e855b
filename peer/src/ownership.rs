//! Ownership lifecycle: encrypt-upload to storage peers, verified download
//! and delete by stable owner identity, and multi-peer chunked fetch for
//! publicly advertised files.
//!
//! The "encryption" is a deterministic, reversible XOR stream keyed from the
//! owner's public identity and the filename. It keeps storage peers from
//! casually reading blobs; it is demonstration-grade and **not**
//! confidentiality.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;

use weft_protocol::{ErrorKind, Message, PeerAddr, PeerId};

use crate::node::PeerNode;
use crate::storage::OwnerMeta;

/// Derive the per-file transform key. Keyed by the stable owner identity so
/// the owner can still decrypt after it rebinds to a new address.
pub fn derive_key(owner_id: &str, filename: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update(b":");
    hasher.update(filename.as_bytes());
    hasher.update(b":weft-demo-key");
    hasher.finalize().into()
}

/// Symmetric XOR stream: applying it twice with the same key is identity.
pub fn transform(data: &[u8], key: &[u8; 32]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

type OpResult<T> = Result<T, (ErrorKind, String)>;

impl PeerNode {
    /// Owner side: encrypt and push `plaintext` to up to `replication`
    /// storage peers chosen by the tracker. Each storage peer registers the
    /// ownership with the tracker itself.
    pub async fn upload_owned(
        self: &Arc<Self>,
        filename: &str,
        plaintext: &[u8],
        replication: usize,
    ) -> OpResult<Vec<PeerAddr>> {
        if plaintext.len() as u64 > self.cfg.max_file_bytes {
            return Err((
                ErrorKind::BadRequest,
                format!("file too large (max {} bytes)", self.cfg.max_file_bytes),
            ));
        }
        let replication = replication.max(1);
        let key = derive_key(&self.identity, filename);
        let ciphertext = BASE64.encode(transform(plaintext, &key));

        let mut stored_on: Vec<PeerAddr> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for _ in 0..replication {
            let target = match self.client.request_best_peer(&self.identity, true).await {
                Ok(Some(addr)) if !stored_on.contains(&addr) => addr,
                Ok(_) => break, // no further distinct peer available
                Err(e) => {
                    errors.push(e.to_string());
                    break;
                }
            };
            let msg = Message::UploadToPeer {
                filename: filename.to_string(),
                ciphertext: ciphertext.clone(),
                owner_id: self.identity.clone(),
                owner_address: self.cfg.advertised_addr(),
            };
            match self.client.call_peer(&target, &msg).await {
                Ok(Message::Ok { .. }) => stored_on.push(target),
                Ok(Message::Error { error, .. }) => errors.push(format!("{target}: {error}")),
                Ok(other) => errors.push(format!("{target}: unexpected {}", other.kind_name())),
                Err(e) => errors.push(format!("{target}: {e}")),
            }
        }

        if stored_on.is_empty() {
            return Err((
                ErrorKind::Transport,
                format!("upload reached no storage peer: {}", errors.join("; ")),
            ));
        }
        self.owned_files
            .lock()
            .unwrap()
            .insert(filename.to_string(), stored_on.clone());
        tracing::info!(filename, peers = stored_on.len(), "owned file uploaded");
        Ok(stored_on)
    }

    /// Owner side: locate storage peers through the tracker, fetch the
    /// ciphertext from any of them, reverse the transform locally.
    pub async fn download_owned(self: &Arc<Self>, filename: &str) -> OpResult<Vec<u8>> {
        let storage = self
            .client
            .find_owned_file(filename, &self.identity)
            .await
            .map_err(|e| (ErrorKind::Transport, e.to_string()))??;
        if storage.is_empty() {
            return Err((ErrorKind::UnknownFile, format!("no storage peers hold {filename}")));
        }

        let mut errors = Vec::new();
        for addr in &storage {
            let msg = Message::GetOwnedFile {
                filename: filename.to_string(),
                owner_id: self.identity.clone(),
            };
            match self.client.call_peer(addr, &msg).await {
                Ok(Message::OwnedFileResponse { found: true, data: Some(data), .. }) => {
                    let ciphertext = BASE64
                        .decode(data.as_bytes())
                        .map_err(|e| (ErrorKind::BadRequest, format!("undecodable ciphertext: {e}")))?;
                    let key = derive_key(&self.identity, filename);
                    tracing::info!(filename, from = %addr, "owned file downloaded");
                    return Ok(transform(&ciphertext, &key));
                }
                Ok(Message::Error { error, kind }) => {
                    if kind == ErrorKind::NotOwner {
                        return Err((kind, error));
                    }
                    errors.push(format!("{addr}: {error}"));
                }
                Ok(_) => errors.push(format!("{addr}: malformed reply")),
                Err(e) => errors.push(format!("{addr}: {e}")),
            }
        }
        Err((
            ErrorKind::Transport,
            format!("every storage peer failed: {}", errors.join("; ")),
        ))
    }

    /// Owner side: authorize via the tracker, remove the blob from every
    /// storage peer, then retire the tracker entry. The tracker entry is
    /// only removed after all storage peers confirmed.
    pub async fn delete_owned(self: &Arc<Self>, filename: &str) -> OpResult<()> {
        let storage = self
            .client
            .find_owned_file(filename, &self.identity)
            .await
            .map_err(|e| (ErrorKind::Transport, e.to_string()))??;

        let mut errors = Vec::new();
        for addr in &storage {
            let msg = Message::DeleteOwnedFile {
                filename: filename.to_string(),
                requester_id: self.identity.clone(),
            };
            match self.client.call_peer(addr, &msg).await {
                Ok(Message::Ok { .. }) => {}
                Ok(Message::Error { error, .. }) => errors.push(format!("{addr}: {error}")),
                Ok(other) => errors.push(format!("{addr}: unexpected {}", other.kind_name())),
                Err(e) => errors.push(format!("{addr}: {e}")),
            }
        }
        if !errors.is_empty() {
            return Err((
                ErrorKind::Transport,
                format!("delete incomplete, tracker entry kept: {}", errors.join("; ")),
            ));
        }

        self.client
            .delete_owned_file(filename, &self.identity)
            .await
            .map_err(|e| (ErrorKind::Transport, e.to_string()))??;
        self.owned_files.lock().unwrap().remove(filename);
        tracing::info!(filename, "owned file deleted");
        Ok(())
    }

    pub fn list_owned(&self) -> Vec<String> {
        let mut names: Vec<String> = self.owned_files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Storage side: accept an encrypted blob held on behalf of `owner_id`,
    /// then register the ownership with the tracker.
    pub async fn handle_upload_to_peer(
        self: &Arc<Self>,
        filename: &str,
        data_b64: &str,
        owner_id: PeerId,
        owner_address: PeerAddr,
    ) -> OpResult<u64> {
        let ciphertext = BASE64
            .decode(data_b64.as_bytes())
            .map_err(|e| (ErrorKind::BadRequest, format!("undecodable payload: {e}")))?;
        if ciphertext.len() as u64 > self.cfg.max_file_bytes {
            return Err((
                ErrorKind::BadRequest,
                format!("file too large (max {} bytes)", self.cfg.max_file_bytes),
            ));
        }
        self.quota.charge_storage(ciphertext.len() as u64)?;

        let meta = OwnerMeta { owner_id: owner_id.clone(), owner_address: owner_address.clone() };
        if let Err(kind) = self.owned.store(filename, &ciphertext, meta).await {
            self.quota.release_storage(ciphertext.len() as u64);
            return Err((kind, format!("storing {filename} failed")));
        }

        if let Err(e) = self
            .client
            .register_owned_file(&owner_id, &owner_address, &self.identity, filename)
            .await
        {
            tracing::warn!(filename, error = %e, "tracker did not record ownership");
        }
        Ok(ciphertext.len() as u64)
    }

    /// Storage side: remove a held blob after verifying the requester.
    pub async fn handle_delete_owned(self: &Arc<Self>, filename: &str, requester_id: &str) -> OpResult<()> {
        match self.owned.remove(filename, requester_id).await {
            Ok(freed) => {
                self.quota.release_storage(freed);
                Ok(())
            }
            Err(kind) => Err((kind, format!("{filename}: {kind}"))),
        }
    }

    /// Fetch an advertised (non-owned) file: probe the size, then pull
    /// fixed-size chunks in parallel across every advertising peer, retrying
    /// each chunk on the other peers. One unobtainable chunk fails the fetch.
    pub async fn download_file(self: &Arc<Self>, filename: &str) -> OpResult<Vec<u8>> {
        let peers = self
            .client
            .find_file(filename)
            .await
            .map_err(|e| (ErrorKind::Transport, e.to_string()))?;
        if peers.is_empty() {
            return Err((ErrorKind::UnknownFile, format!("{filename} not advertised by any peer")));
        }

        let mut size = None;
        for addr in &peers {
            let msg = Message::StatFile { filename: filename.to_string() };
            if let Ok(Message::FileStat { found: true, size: s, .. }) = self.client.call_peer(addr, &msg).await {
                size = Some(s);
                break;
            }
        }
        let size = size.ok_or_else(|| {
            (ErrorKind::Transport, format!("no advertising peer answered a size probe for {filename}"))
        })?;
        if size == 0 {
            return Ok(Vec::new());
        }

        let chunk_bytes = self.cfg.chunk_bytes.max(1);
        let chunk_count = size.div_ceil(chunk_bytes);
        let timeout = self.cfg.socket_timeout;
        let mut join_set: JoinSet<Result<(u64, Vec<u8>), u64>> = JoinSet::new();

        for index in 0..chunk_count {
            let peers = peers.clone();
            let filename = filename.to_string();
            let offset = index * chunk_bytes;
            let len = chunk_bytes.min(size - offset);
            join_set.spawn(async move {
                // Start at a different peer per chunk, rotate on failure.
                for attempt in 0..peers.len() {
                    let addr = &peers[(index as usize + attempt) % peers.len()];
                    let msg = Message::GetFileChunk { filename: filename.clone(), offset, len };
                    match weft_protocol::wire::request(addr, &msg, timeout).await {
                        Ok(Message::FileChunk { data, .. }) => match BASE64.decode(data.as_bytes()) {
                            Ok(bytes) if bytes.len() as u64 == len => return Ok((index, bytes)),
                            _ => tracing::debug!(chunk = index, peer = %addr, "bad chunk payload"),
                        },
                        Ok(_) => tracing::debug!(chunk = index, peer = %addr, "chunk refused"),
                        Err(e) => tracing::debug!(chunk = index, peer = %addr, error = %e, "chunk fetch failed"),
                    }
                }
                Err(index)
            });
        }

        let mut chunks: Vec<Option<Vec<u8>>> = vec![None; chunk_count as usize];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((index, bytes))) => chunks[index as usize] = Some(bytes),
                Ok(Err(index)) => {
                    return Err((
                        ErrorKind::Transport,
                        format!("chunk {index} of {filename} unavailable on every peer"),
                    ));
                }
                Err(e) => return Err((ErrorKind::Fatal, format!("chunk worker failed: {e}"))),
            }
        }

        let mut assembled = Vec::with_capacity(size as usize);
        for (index, chunk) in chunks.into_iter().enumerate() {
            match chunk {
                Some(bytes) => assembled.extend(bytes),
                None => {
                    return Err((
                        ErrorKind::Transport,
                        format!("chunk {index} of {filename} missing after fetch"),
                    ));
                }
            }
        }
        tracing::info!(filename, bytes = assembled.len(), peers = peers.len(), "network download complete");
        Ok(assembled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_is_an_involution() {
        let key = derive_key("owner-1", "doc.bin");
        let plain = b"the quick brown fox".to_vec();
        let cipher = transform(&plain, &key);
        assert_ne!(cipher, plain);
        assert_eq!(transform(&cipher, &key), plain);
    }

    #[test]
    fn keys_differ_per_owner_and_file() {
        let a = derive_key("owner-1", "doc.bin");
        let b = derive_key("owner-2", "doc.bin");
        let c = derive_key("owner-1", "other.bin");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_survives_address_changes() {
        // The key depends only on identity + filename, so a peer that
        // rebinds to a new address can still decrypt its files.
        let before = derive_key("stable-id", "doc.bin");
        let after = derive_key("stable-id", "doc.bin");
        assert_eq!(before, after);
    }
}
