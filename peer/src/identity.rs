//! Persistent peer identity: a UUID generated on first start, stored as a
//! single line of text and reused on every subsequent start. The identity
//! never rotates, even when the peer rebinds to a new address.

use std::path::Path;

use anyhow::{Context, Result};
use uuid::Uuid;

use weft_protocol::PeerId;

pub async fn load_or_create(path: &Path) -> Result<PeerId> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let id = raw.trim().to_string();
            if id.is_empty() {
                anyhow::bail!("identity file {} is empty", path.display());
            }
            tracing::info!(identity = %id, "loaded peer identity");
            Ok(id)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = Uuid::new_v4().to_string();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::write(path, format!("{id}\n"))
                .await
                .with_context(|| format!("writing identity file {}", path.display()))?;
            tracing::info!(identity = %id, "generated fresh peer identity");
            Ok(id)
        }
        Err(e) => Err(e).with_context(|| format!("reading identity file {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_is_stable_across_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("identity");
        let first = load_or_create(&path).await.unwrap();
        let second = load_or_create(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 36, "uuid text form");
    }

    #[tokio::test]
    async fn empty_identity_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("identity");
        tokio::fs::write(&path, "\n").await.unwrap();
        assert!(load_or_create(&path).await.is_err());
    }
}
