//! `StateVersionManager`: a forest of named, copy-on-write state-tree
//! versions (spec §4.1). Versions are `im::OrdMap` snapshots — cloning one is
//! an O(1) reference-counted pointer copy (structural sharing); writing to a
//! version path-copies only the spine nodes that change, leaving every other
//! live version untouched. This is the "named immutable roots with
//! structural sharing" design called for in spec §9.

use crate::crypto::Hash;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub type VersionName = String;
pub type TreeMap = im::OrdMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown state version: {0}")]
    VersionNotFound(String),
    #[error("version {0} is currently finalized and cannot be deleted")]
    CannotDeleteFinalized(String),
}

struct VersionEntry {
    data: TreeMap,
    parent: Option<VersionName>,
}

struct Inner {
    versions: HashMap<VersionName, VersionEntry>,
    finalized: Option<VersionName>,
    temp_counter: u64,
}

pub struct StateVersionManager {
    inner: Mutex<Inner>,
}

impl Default for StateVersionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateVersionManager {
    pub fn new() -> Self {
        StateVersionManager {
            inner: Mutex::new(Inner {
                versions: HashMap::new(),
                finalized: None,
                temp_counter: 0,
            }),
        }
    }

    /// Bootstrap: register `name` as an empty, finalized root version (used for genesis).
    pub fn init_finalized(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.versions.insert(
            name.to_string(),
            VersionEntry {
                data: TreeMap::new(),
                parent: None,
            },
        );
        inner.finalized = Some(name.to_string());
    }

    /// Copy-on-write fork of `base` under `new_name`. An absent `base` forks an empty tree.
    pub fn clone_version(&self, base: &str, new_name: &str) -> Result<Hash, StateError> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner
            .versions
            .get(base)
            .map(|e| e.data.clone())
            .unwrap_or_default();
        let root = root_hash(&data);
        inner.versions.insert(
            new_name.to_string(),
            VersionEntry {
                data,
                parent: Some(base.to_string()),
            },
        );
        Ok(root)
    }

    /// Non-persistent fork intended to be discarded after one validation pass.
    /// Returns the generated name and the forked root hash.
    pub fn clone_to_temp(&self, base: &str, prefix: &str) -> Result<(VersionName, Hash), StateError> {
        let name = {
            let mut inner = self.inner.lock().unwrap();
            inner.temp_counter += 1;
            format!("{}-tmp-{}", prefix, inner.temp_counter)
        };
        let root = self.clone_version(base, &name)?;
        Ok((name, root))
    }

    /// Promote `name` to be the finalized version. The previous finalized
    /// version is evicted unless some other live version still parents off it.
    pub fn finalize(&self, name: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.versions.contains_key(name) {
            return Err(StateError::VersionNotFound(name.to_string()));
        }
        let previous = inner.finalized.replace(name.to_string());
        if let Some(prev) = previous {
            if prev != name && !Self::is_referenced(&inner.versions, &prev) {
                inner.versions.remove(&prev);
            }
        }
        Ok(())
    }

    fn is_referenced(versions: &HashMap<VersionName, VersionEntry>, target: &str) -> bool {
        versions
            .values()
            .any(|e| e.parent.as_deref() == Some(target))
    }

    pub fn delete(&self, name: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized.as_deref() == Some(name) {
            return Err(StateError::CannotDeleteFinalized(name.to_string()));
        }
        if inner.versions.remove(name).is_none() {
            return Err(StateError::VersionNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Rebind the physical tree of `src` to live under the name `dst`, without copying.
    pub fn transfer(&self, src: &str, dst: &str) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .versions
            .remove(src)
            .ok_or_else(|| StateError::VersionNotFound(src.to_string()))?;
        inner.versions.insert(dst.to_string(), entry);
        Ok(())
    }

    pub fn get_root(&self, name: &str) -> Option<Hash> {
        let inner = self.inner.lock().unwrap();
        inner.versions.get(name).map(|e| root_hash(&e.data))
    }

    pub fn version_list(&self) -> Vec<VersionName> {
        let inner = self.inner.lock().unwrap();
        inner.versions.keys().cloned().collect()
    }

    pub fn final_version(&self) -> Option<VersionName> {
        self.inner.lock().unwrap().finalized.clone()
    }

    pub fn num_versions(&self) -> usize {
        self.inner.lock().unwrap().versions.len()
    }

    pub fn get(&self, name: &str, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.versions.get(name)?.data.get(key).cloned()
    }

    pub fn set(&self, name: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .versions
            .get_mut(name)
            .ok_or_else(|| StateError::VersionNotFound(name.to_string()))?;
        entry.data.insert(key, value);
        Ok(())
    }

    pub fn remove(&self, name: &str, key: &[u8]) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .versions
            .get_mut(name)
            .ok_or_else(|| StateError::VersionNotFound(name.to_string()))?;
        entry.data.remove(key);
        Ok(())
    }

    /// Cheap (O(1), reference-counted) snapshot of a version's data, for
    /// per-transaction backup/restore during speculative execution.
    pub fn snapshot(&self, name: &str) -> Option<TreeMap> {
        let inner = self.inner.lock().unwrap();
        inner.versions.get(name).map(|e| e.data.clone())
    }

    pub fn restore(&self, name: &str, data: TreeMap) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .versions
            .get_mut(name)
            .ok_or_else(|| StateError::VersionNotFound(name.to_string()))?;
        entry.data = data;
        Ok(())
    }

    /// Snapshot of every `(key, value)` pair under `name`, sorted by key.
    pub fn entries(&self, name: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .versions
            .get(name)
            .map(|e| e.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn entries_under(&self, name: &str, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries(name)
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect()
    }
}

fn root_hash(data: &TreeMap) -> Hash {
    let mut hasher = Sha256::new();
    for (k, v) in data.iter() {
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k);
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v);
    }
    Hash(hasher.finalize().into())
}
