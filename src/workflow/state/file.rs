// SPDX-License-Identifier: MIT

//! Filesystem-backed state store
//!
//! Layout: `{root}/{escaped workflow id}.json`, pretty-printed JSON.
//! A save writes a uniquely named temp file in the same directory, syncs it
//! and renames it over the target, so readers only ever see a complete
//! snapshot. Saves for the same id are serialised by a per-id lock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::schema::WorkflowState;
use super::store::StateStore;
use crate::sdk::error::StateStoreError;

const EXTENSION: &str = "json";

pub struct FileStateStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileStateStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StateStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        log::debug!("file state store at {}", root.display());
        Ok(Self {
            root,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", escape_id(workflow_id), EXTENSION))
    }

    fn lock_for(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StateStoreError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let lock = self.lock_for(&state.workflow_id);
        let _guard = lock.lock().await;

        let target = self.path_for(&state.workflow_id);
        let tmp = self.root.join(format!(
            ".{}.{}.tmp",
            escape_id(&state.workflow_id),
            uuid::Uuid::new_v4()
        ));

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn load(&self, workflow_id: &str) -> Result<WorkflowState, StateStoreError> {
        let path = self.path_for(workflow_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateStoreError::NotFound(workflow_id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StateStoreError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let removed = match fs::remove_file(self.path_for(workflow_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        };
        if removed.is_ok() {
            self.locks.remove(workflow_id);
        }
        removed
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(unescape_id)
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Map a workflow id onto a safe file stem. Bytes outside `[A-Za-z0-9_-]`
/// become `%XX`, so the mapping is reversible and never escapes `root`.
fn escape_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn unescape_id(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let raw = stem.as_bytes();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}
