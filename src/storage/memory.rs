use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{IpamError, Result};
use crate::model::Prefix;
use crate::storage::Storage;

/// In-memory reference backend.
///
/// A single write lock makes every create/update/delete atomic, which is all
/// the version-check contract needs; cross-process deployments swap this for
/// a backend whose conditional write is atomic on the shared store instead.
#[derive(Default)]
pub struct InMemoryStorage {
    prefixes: RwLock<HashMap<String, Prefix>>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn create(&self, prefix: &Prefix) -> Result<Prefix> {
        let mut prefixes = self.prefixes.write();
        let key = prefix.cidr().to_string();
        if let Some(existing) = prefixes.get(&key) {
            return Ok(existing.clone());
        }
        prefixes.insert(key, prefix.clone());
        Ok(prefix.clone())
    }

    fn read(&self, cidr: &str) -> Result<Prefix> {
        self.prefixes
            .read()
            .get(cidr)
            .cloned()
            .ok_or_else(|| IpamError::NotFound(format!("prefix {cidr} not found")))
    }

    fn read_all(&self) -> Result<Vec<Prefix>> {
        Ok(self.prefixes.read().values().cloned().collect())
    }

    fn update(&self, prefix: &Prefix) -> Result<Prefix> {
        let mut prefixes = self.prefixes.write();
        let key = prefix.cidr().to_string();
        let stored = prefixes
            .get(&key)
            .ok_or_else(|| IpamError::NotFound(format!("prefix {key} not found")))?;
        if stored.version() != prefix.version() {
            return Err(IpamError::VersionConflict(key));
        }
        let mut next = prefix.clone();
        next.set_version(prefix.version() + 1);
        prefixes.insert(key, next.clone());
        Ok(next)
    }

    fn delete(&self, prefix: &Prefix) -> Result<Prefix> {
        let mut prefixes = self.prefixes.write();
        let key = prefix.cidr().to_string();
        Ok(prefixes.remove(&key).unwrap_or_else(|| prefix.clone()))
    }

    fn exists(&self, prefix: &Prefix) -> Option<Prefix> {
        self.prefixes.read().get(&prefix.cidr().to_string()).cloned()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
