//! The storage port: the contract every persistence backend satisfies.
//!
//! The engine coordinates concurrent mutation solely through this port's
//! version-checked `update`; any backend offering an atomic conditional
//! write (SQL `UPDATE .. WHERE version = ?`, a KV compare-and-swap, or an
//! in-process lock) can implement it with identical observable semantics.
//! One behavioral suite in `tests/storage_contract.rs` validates every
//! backend against the same scenarios.

mod memory;

pub use memory::InMemoryStorage;

use crate::error::Result;
use crate::model::Prefix;

/// Persistence contract for [`Prefix`] records, keyed by canonical CIDR
/// string.
pub trait Storage: Send + Sync {
    /// Inserts a prefix. Creating an already-present key is a no-op success
    /// returning the stored record, which makes root registration
    /// idempotent.
    fn create(&self, prefix: &Prefix) -> Result<Prefix>;

    /// Reads one prefix. Fails with [`crate::IpamError::NotFound`] carrying
    /// the backend's native not-found cause.
    fn read(&self, cidr: &str) -> Result<Prefix>;

    /// Full snapshot of all stored prefixes; ordering is unspecified.
    fn read_all(&self) -> Result<Vec<Prefix>>;

    /// Version-checked write: succeeds only while the stored version still
    /// equals `prefix.version()`, and increments the stored version
    /// atomically. A stale caller gets
    /// [`crate::IpamError::VersionConflict`], never a silent overwrite.
    fn update(&self, prefix: &Prefix) -> Result<Prefix>;

    /// Removes a prefix. Deleting an absent key is a harmless success, so
    /// delete-then-delete-again never errors.
    fn delete(&self, prefix: &Prefix) -> Result<Prefix>;

    /// Existence probe returning the stored record when present.
    fn exists(&self, prefix: &Prefix) -> Option<Prefix>;

    /// Short backend identifier used in logs.
    fn name(&self) -> &'static str;
}
