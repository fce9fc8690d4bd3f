use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cidr::{ip_to_u128, Cidr};
use crate::error::{IpamError, Result};
use crate::ipam::config::RetryConfig;
use crate::ipam::context::OpContext;
use crate::ipam::retry::retry_on_version_conflict;
use crate::model::{Prefix, Usage};
use crate::storage::{InMemoryStorage, Storage};

/// The allocation engine.
///
/// Owns one storage handle, constructed at startup and threaded through
/// explicitly. The engine holds no cross-call lock: all coordination between
/// concurrent actors, in this process or others sharing the same store, goes
/// through the storage port's version-checked update. Operations on
/// different parents never contend; operations on one parent linearize in
/// the order the store accepts their writes.
///
/// # Example
///
/// ```rust
/// use cidralloc::{Ipam, OpContext};
///
/// let ipam = Ipam::memory();
/// let ctx = OpContext::background();
/// ipam.new_prefix(&ctx, "10.0.0.0/16")?;
/// let child = ipam.acquire_child_prefix(&ctx, "10.0.0.0/16", 24)?;
/// let ip = ipam.acquire_ip(&ctx, &child.cidr().to_string())?;
/// assert_eq!(child.cidr().to_string(), "10.0.0.0/24");
/// assert_eq!(ip.to_string(), "10.0.0.1");
/// # Ok::<(), cidralloc::IpamError>(())
/// ```
pub struct Ipam {
    storage: Arc<dyn Storage>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Ipam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipam")
            .field("backend", &self.storage.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Ipam {
    /// Creates an engine on top of the given backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            retry: RetryConfig::default(),
        }
    }

    /// Creates an engine backed by a fresh [`InMemoryStorage`].
    pub fn memory() -> Self {
        Self::new(Arc::new(InMemoryStorage::new()))
    }

    /// Replaces the retry policy.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Registers a root prefix.
    ///
    /// Idempotent: registering an already-present CIDR returns the stored
    /// record. A root overlapping a different existing root is rejected with
    /// [`IpamError::Overlap`].
    pub fn new_prefix(&self, ctx: &OpContext, cidr: &str) -> Result<Prefix> {
        ctx.check()?;
        let cidr = Cidr::parse(cidr)?;
        for existing in self.storage.read_all()? {
            if existing.is_root()
                && existing.cidr() != cidr
                && existing.cidr().overlaps(&cidr)
            {
                return Err(IpamError::Overlap(
                    cidr.to_string(),
                    existing.cidr().to_string(),
                ));
            }
        }
        let created = self.storage.create(&Prefix::new_root(cidr))?;
        info!(prefix = %cidr, backend = self.storage.name(), "root prefix registered");
        Ok(created)
    }

    /// Exact-match lookup by CIDR string.
    pub fn prefix_from(&self, ctx: &OpContext, cidr: &str) -> Result<Prefix> {
        ctx.check()?;
        self.storage.read(cidr)
    }

    /// Deletes a prefix that holds no allocated children or addresses.
    ///
    /// Deleting a child prefix also frees its slot in the parent, so the
    /// space becomes allocatable again.
    pub fn delete_prefix(&self, ctx: &OpContext, cidr: &str) -> Result<Prefix> {
        ctx.check()?;
        let cidr = Cidr::parse(cidr)?;
        let prefix = self.storage.read(&cidr.to_string())?;
        if prefix.has_allocated_children() {
            return Err(IpamError::HasChildren(cidr.to_string()));
        }
        if prefix.has_allocated_ips() {
            return Err(IpamError::HasIps(cidr.to_string()));
        }
        if let Some(parent_cidr) = prefix.parent_cidr() {
            // Row first, slot second: the freed slot only becomes visible to
            // first-fit scans once no stale child record can be handed out.
            retry_on_version_conflict(ctx, &self.retry, || {
                self.storage.delete(&prefix)?;
                let parent = self.storage.read(&parent_cidr.to_string())?;
                let candidate = parent.with_child_released(&cidr)?;
                self.storage.update(&candidate)?;
                Ok(())
            })?;
        } else {
            self.storage.delete(&prefix)?;
        }
        debug!(prefix = %cidr, "prefix deleted");
        Ok(prefix)
    }

    /// Acquires the first free child block of `length` bits under `parent`.
    ///
    /// First-fit by ascending address. A version conflict against a racing
    /// actor is absorbed and recomputed; exhaustion surfaces
    /// [`IpamError::NoCapacity`] immediately since retrying cannot
    /// manufacture space.
    pub fn acquire_child_prefix(
        &self,
        ctx: &OpContext,
        parent: &str,
        length: u8,
    ) -> Result<Prefix> {
        ctx.check()?;
        let parent_cidr = Cidr::parse(parent)?;
        let parent_key = parent_cidr.to_string();
        retry_on_version_conflict(ctx, &self.retry, || {
            let parent_prefix = self.storage.read(&parent_key)?;
            self.ensure_block_mode(&parent_prefix)?;
            let child_cidr = parent_prefix.first_free_child(length)?;
            self.persist_child(&parent_prefix, &child_cidr)
        })
    }

    /// Acquires a caller-chosen child block under `parent`.
    ///
    /// Never falls back to a different block: a taken target surfaces
    /// [`IpamError::AlreadyAllocated`], a target outside the parent
    /// [`IpamError::OutOfRange`].
    pub fn acquire_specific_child_prefix(
        &self,
        ctx: &OpContext,
        parent: &str,
        child: &str,
    ) -> Result<Prefix> {
        ctx.check()?;
        let parent_cidr = Cidr::parse(parent)?;
        let child_cidr = Cidr::parse(child)?;
        if child_cidr.len() <= parent_cidr.len() || !parent_cidr.contains(&child_cidr) {
            return Err(IpamError::OutOfRange(format!(
                "{child_cidr} is not a subdivision of {parent_cidr}"
            )));
        }
        retry_on_version_conflict(ctx, &self.retry, || {
            let parent_prefix = self.storage.read(&parent_cidr.to_string())?;
            self.ensure_block_mode(&parent_prefix)?;
            if let Some(length) = parent_prefix.child_prefix_length() {
                if length != child_cidr.len() {
                    return Err(IpamError::InvalidSubdivision(format!(
                        "prefix {parent_cidr} is split into /{length} children, cannot carve /{}",
                        child_cidr.len()
                    )));
                }
            }
            if parent_prefix.is_child_allocated(&child_cidr) {
                return Err(IpamError::AlreadyAllocated(format!(
                    "child prefix {child_cidr} in {parent_cidr}"
                )));
            }
            self.persist_child(&parent_prefix, &child_cidr)
        })
    }

    /// Returns a child block to its parent and removes its record.
    ///
    /// Refused while the child still has addresses or nested children in
    /// use. Returns the updated parent.
    pub fn release_child_prefix(&self, ctx: &OpContext, child: &str) -> Result<Prefix> {
        ctx.check()?;
        let child_cidr = Cidr::parse(child)?;
        let child_prefix = self.storage.read(&child_cidr.to_string())?;
        let parent_cidr = child_prefix.parent_cidr().ok_or_else(|| {
            IpamError::NotAllocated(format!("prefix {child_cidr} is not a child prefix"))
        })?;
        if child_prefix.has_allocated_ips() {
            return Err(IpamError::HasIps(child_cidr.to_string()));
        }
        if child_prefix.has_allocated_children() {
            return Err(IpamError::HasChildren(child_cidr.to_string()));
        }
        // Row first, slot second: the freed slot only becomes visible to
        // first-fit scans once no stale child record can be handed out.
        let released = retry_on_version_conflict(ctx, &self.retry, || {
            self.storage.delete(&child_prefix)?;
            let parent = self.storage.read(&parent_cidr.to_string())?;
            let candidate = parent.with_child_released(&child_cidr)?;
            self.storage.update(&candidate)
        })?;
        debug!(child = %child_cidr, parent = %parent_cidr, "child prefix released");
        Ok(released)
    }

    /// Acquires the lowest free usable address in `prefix`.
    pub fn acquire_ip(&self, ctx: &OpContext, prefix: &str) -> Result<IpAddr> {
        self.acquire_ip_inner(ctx, prefix, None)
    }

    /// Acquires one specific address in `prefix`.
    ///
    /// Never falls back to a different address: a taken target surfaces
    /// [`IpamError::AlreadyAllocated`], one outside the usable range
    /// [`IpamError::OutOfRange`].
    pub fn acquire_specific_ip(
        &self,
        ctx: &OpContext,
        prefix: &str,
        ip: IpAddr,
    ) -> Result<IpAddr> {
        self.acquire_ip_inner(ctx, prefix, Some(ip))
    }

    fn acquire_ip_inner(
        &self,
        ctx: &OpContext,
        prefix: &str,
        wanted: Option<IpAddr>,
    ) -> Result<IpAddr> {
        ctx.check()?;
        let cidr = Cidr::parse(prefix)?;
        if let Some(ip) = wanted {
            let (first, last) = cidr.host_range();
            let value = ip_to_u128(ip);
            if !cidr.contains_ip(ip) || value < first || value > last {
                return Err(IpamError::OutOfRange(format!(
                    "ip {ip} is not a usable address of {cidr}"
                )));
            }
        }
        retry_on_version_conflict(ctx, &self.retry, || {
            let record = self.storage.read(&cidr.to_string())?;
            if record.child_prefix_length().is_some() {
                return Err(IpamError::InvalidState(format!(
                    "prefix {cidr} is split into child prefixes, cannot acquire addresses"
                )));
            }
            let ip = match wanted {
                Some(ip) => {
                    if record.is_ip_allocated(ip) {
                        return Err(IpamError::AlreadyAllocated(format!("ip {ip} in {cidr}")));
                    }
                    ip
                }
                None => record.first_free_ip()?,
            };
            let candidate = record.with_ip_allocated(ip);
            self.storage.update(&candidate)?;
            debug!(ip = %ip, prefix = %cidr, "address acquired");
            Ok(ip)
        })
    }

    /// Marks an address free again.
    pub fn release_ip(&self, ctx: &OpContext, prefix: &str, ip: IpAddr) -> Result<()> {
        ctx.check()?;
        let cidr = Cidr::parse(prefix)?;
        retry_on_version_conflict(ctx, &self.retry, || {
            let record = self.storage.read(&cidr.to_string())?;
            let candidate = record.with_ip_released(ip)?;
            self.storage.update(&candidate)?;
            Ok(())
        })?;
        debug!(ip = %ip, prefix = %cidr, "address released");
        Ok(())
    }

    /// Snapshot of every stored prefix; ordering is unspecified.
    pub fn read_all_prefixes(&self, ctx: &OpContext) -> Result<Vec<Prefix>> {
        ctx.check()?;
        self.storage.read_all()
    }

    /// The CIDR strings of every stored prefix, sorted.
    pub fn read_all_prefix_cidrs(&self, ctx: &OpContext) -> Result<Vec<String>> {
        let mut cidrs: Vec<String> = self
            .read_all_prefixes(ctx)?
            .iter()
            .map(|p| p.cidr().to_string())
            .collect();
        cidrs.sort();
        Ok(cidrs)
    }

    /// Allocation statistics of one prefix.
    pub fn usage(&self, ctx: &OpContext, cidr: &str) -> Result<Usage> {
        Ok(self.prefix_from(ctx, cidr)?.usage())
    }

    /// Exports the full prefix set as JSON, sorted by CIDR.
    pub fn dump(&self, ctx: &OpContext) -> Result<String> {
        let mut prefixes = self.read_all_prefixes(ctx)?;
        prefixes.sort_by_key(|p| p.cidr());
        serde_json::to_string_pretty(&prefixes)
            .map_err(|e| IpamError::Serialization(e.to_string()))
    }

    /// Imports a [`Ipam::dump`] export into an empty store.
    pub fn load(&self, ctx: &OpContext, json: &str) -> Result<()> {
        ctx.check()?;
        if !self.storage.read_all()?.is_empty() {
            return Err(IpamError::InvalidState(
                "cannot load into a non-empty store".into(),
            ));
        }
        let prefixes: Vec<Prefix> =
            serde_json::from_str(json).map_err(|e| IpamError::Serialization(e.to_string()))?;
        for prefix in &prefixes {
            self.storage.create(prefix)?;
        }
        info!(
            count = prefixes.len(),
            backend = self.storage.name(),
            "prefix set loaded"
        );
        Ok(())
    }

    fn ensure_block_mode(&self, parent: &Prefix) -> Result<()> {
        if parent.has_allocated_ips() {
            return Err(IpamError::InvalidState(format!(
                "prefix {} has addresses in use, cannot carve child prefixes",
                parent.cidr()
            )));
        }
        Ok(())
    }

    /// CAS on the parent is the linearization point; the child record is
    /// created only after the slot claim landed.
    fn persist_child(&self, parent: &Prefix, child: &Cidr) -> Result<Prefix> {
        let candidate = parent.with_child_allocated(child);
        self.storage.update(&candidate)?;
        let record = self
            .storage
            .create(&Prefix::new_child(*child, parent.cidr()))?;
        debug!(child = %child, parent = %parent.cidr(), "child prefix acquired");
        Ok(record)
    }
}
