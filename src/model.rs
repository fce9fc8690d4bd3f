//! The `Prefix` record and its pure allocation transforms.
//!
//! A `Prefix` is the unit of persistence: one CIDR block under management,
//! either a root or a child carved out of a parent. Allocation state is kept
//! as sparse maps recording only touched entries, so large spaces are never
//! eagerly enumerated. All transforms return a new value; the engine builds
//! candidate next-states from snapshots and persists them through the
//! version-checked storage port.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::cidr::{u128_to_ip, Cidr};
use crate::error::{IpamError, Result};

/// A CIDR block under management.
///
/// A prefix is used either to cut child blocks or to hand out individual
/// addresses, never both: the first child acquisition fixes
/// `child_prefix_length` and puts the prefix into block mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefix {
    cidr: Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_cidr: Option<Cidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    child_prefix_length: Option<u8>,
    /// Sparse child map: `true` = allocated, `false` = released again,
    /// absent = never touched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    available_child_prefixes: BTreeMap<Cidr, bool>,
    /// Addresses handed out directly from this prefix.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    ips: BTreeSet<IpAddr>,
    version: u64,
}

impl Prefix {
    /// Builds a fresh root prefix record.
    pub fn new_root(cidr: Cidr) -> Self {
        Self {
            cidr,
            parent_cidr: None,
            child_prefix_length: None,
            available_child_prefixes: BTreeMap::new(),
            ips: BTreeSet::new(),
            version: 0,
        }
    }

    /// Builds a fresh child prefix record under `parent`.
    pub fn new_child(cidr: Cidr, parent: Cidr) -> Self {
        Self {
            parent_cidr: Some(parent),
            ..Self::new_root(cidr)
        }
    }

    /// The block this record manages; its canonical string is the identity
    /// key in storage.
    pub fn cidr(&self) -> Cidr {
        self.cidr
    }

    /// The enclosing block, or `None` for a root prefix.
    pub fn parent_cidr(&self) -> Option<Cidr> {
        self.parent_cidr
    }

    /// Fixed child length once this prefix has been split.
    pub fn child_prefix_length(&self) -> Option<u8> {
        self.child_prefix_length
    }

    /// Optimistic-concurrency stamp. Opaque to callers; bumped by the
    /// storage port on every accepted update.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Returns `true` for a root prefix.
    pub fn is_root(&self) -> bool {
        self.parent_cidr.is_none()
    }

    /// Returns `true` when the given child block is currently allocated.
    pub fn is_child_allocated(&self, child: &Cidr) -> bool {
        self.available_child_prefixes
            .get(child)
            .copied()
            .unwrap_or(false)
    }

    /// Returns `true` when any child block is currently allocated.
    pub fn has_allocated_children(&self) -> bool {
        self.available_child_prefixes.values().any(|v| *v)
    }

    /// Returns `true` when the given address is currently in use.
    pub fn is_ip_allocated(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip)
    }

    /// Returns `true` when any address is in use.
    pub fn has_allocated_ips(&self) -> bool {
        !self.ips.is_empty()
    }

    /// Deterministic first-fit: the lowest-addressed free child at `length`.
    ///
    /// Determinism matters for convergence under contention: two actors on
    /// the same stale snapshot compute the same candidate, the version check
    /// lets one land, and the loser re-reads and picks the next slot.
    pub fn first_free_child(&self, length: u8) -> Result<Cidr> {
        if let Some(existing) = self.child_prefix_length {
            if existing != length {
                return Err(IpamError::InvalidSubdivision(format!(
                    "prefix {} is split into /{existing} children, cannot carve /{length}",
                    self.cidr
                )));
            }
        }
        for child in self.cidr.children(length)? {
            if !self.is_child_allocated(&child) {
                return Ok(child);
            }
        }
        Err(IpamError::NoCapacity(format!(
            "no free child prefix of length /{length} in {}",
            self.cidr
        )))
    }

    /// Returns a copy with `child` marked allocated and the child length
    /// pinned.
    pub fn with_child_allocated(&self, child: &Cidr) -> Prefix {
        let mut next = self.clone();
        next.child_prefix_length = Some(child.len());
        next.available_child_prefixes.insert(*child, true);
        next
    }

    /// Returns a copy with `child`'s slot marked free again.
    ///
    /// Fails with [`IpamError::NotAllocated`] when the slot is not currently
    /// allocated.
    pub fn with_child_released(&self, child: &Cidr) -> Result<Prefix> {
        if !self.is_child_allocated(child) {
            return Err(IpamError::NotAllocated(format!(
                "child prefix {child} is not allocated in {}",
                self.cidr
            )));
        }
        let mut next = self.clone();
        next.available_child_prefixes.insert(*child, false);
        Ok(next)
    }

    /// Deterministic first-fit: the lowest free usable address.
    pub fn first_free_ip(&self) -> Result<IpAddr> {
        let (first, last) = self.cidr.host_range();
        let mut cur = first;
        loop {
            let ip = u128_to_ip(self.cidr.family(), cur);
            if !self.ips.contains(&ip) {
                return Ok(ip);
            }
            if cur == last {
                break;
            }
            cur += 1;
        }
        Err(IpamError::NoCapacity(format!(
            "no free addresses in {}",
            self.cidr
        )))
    }

    /// Returns a copy with `ip` marked in use.
    pub fn with_ip_allocated(&self, ip: IpAddr) -> Prefix {
        let mut next = self.clone();
        next.ips.insert(ip);
        next
    }

    /// Returns a copy with `ip` marked free.
    ///
    /// Fails with [`IpamError::NotAllocated`] when the address was never
    /// acquired.
    pub fn with_ip_released(&self, ip: IpAddr) -> Result<Prefix> {
        if !self.ips.contains(&ip) {
            return Err(IpamError::NotAllocated(format!(
                "ip {ip} is not allocated in {}",
                self.cidr
            )));
        }
        let mut next = self.clone();
        next.ips.remove(&ip);
        Ok(next)
    }

    /// Allocation statistics for this prefix.
    pub fn usage(&self) -> Usage {
        let acquired_prefixes = self
            .available_child_prefixes
            .values()
            .filter(|v| **v)
            .count() as u64;
        let available_prefixes = match self.child_prefix_length {
            Some(length) => {
                let diff = u32::from(length - self.cidr.len());
                let total = if diff >= 128 {
                    u128::MAX
                } else {
                    1u128 << diff
                };
                total - u128::from(acquired_prefixes)
            }
            None => 0,
        };
        Usage {
            available_ips: self.cidr.usable_hosts(),
            acquired_ips: self.ips.len() as u64,
            available_prefixes,
            acquired_prefixes,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr)
    }
}

/// Allocation statistics reported by [`Prefix::usage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Total individually allocatable addresses in the block.
    pub available_ips: u128,
    /// Addresses currently in use.
    pub acquired_ips: u64,
    /// Remaining child slots at the chosen child length; zero while unsplit.
    pub available_prefixes: u128,
    /// Child blocks currently allocated.
    pub acquired_prefixes: u64,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip:{}/{}", self.acquired_ips, self.available_ips)?;
        if self.acquired_prefixes > 0 || self.available_prefixes > 0 {
            write!(
                f,
                " prefixes alloc:{} avail:{}",
                self.acquired_prefixes, self.available_prefixes
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        Cidr::parse(s).expect("cidr")
    }

    #[test]
    fn first_fit_skips_allocated_children() {
        let prefix = Prefix::new_root(cidr("10.0.0.0/16"));
        let first = prefix.first_free_child(24).expect("first");
        assert_eq!(first.to_string(), "10.0.0.0/24");

        let prefix = prefix.with_child_allocated(&first);
        let second = prefix.first_free_child(24).expect("second");
        assert_eq!(second.to_string(), "10.0.1.0/24");

        // A released slot becomes the lowest candidate again.
        let prefix = prefix.with_child_allocated(&second);
        let prefix = prefix.with_child_released(&first).expect("release");
        let again = prefix.first_free_child(24).expect("again");
        assert_eq!(again, first);
    }

    #[test]
    fn mixed_child_lengths_rejected() {
        let prefix = Prefix::new_root(cidr("10.0.0.0/16"));
        let child = prefix.first_free_child(24).expect("child");
        let prefix = prefix.with_child_allocated(&child);
        assert!(matches!(
            prefix.first_free_child(25),
            Err(IpamError::InvalidSubdivision(_))
        ));
    }

    #[test]
    fn child_exhaustion() {
        let mut prefix = Prefix::new_root(cidr("10.0.0.0/30"));
        for _ in 0..2 {
            let child = prefix.first_free_child(31).expect("child");
            prefix = prefix.with_child_allocated(&child);
        }
        assert!(matches!(
            prefix.first_free_child(31),
            Err(IpamError::NoCapacity(_))
        ));
    }

    #[test]
    fn release_of_untouched_child_fails() {
        let prefix = Prefix::new_root(cidr("10.0.0.0/16"));
        assert!(matches!(
            prefix.with_child_released(&cidr("10.0.0.0/24")),
            Err(IpamError::NotAllocated(_))
        ));
    }

    #[test]
    fn ip_first_fit_and_release() {
        let prefix = Prefix::new_root(cidr("192.168.0.0/30"));
        let first = prefix.first_free_ip().expect("first");
        assert_eq!(first.to_string(), "192.168.0.1");

        let prefix = prefix.with_ip_allocated(first);
        let second = prefix.first_free_ip().expect("second");
        assert_eq!(second.to_string(), "192.168.0.2");

        let prefix = prefix.with_ip_allocated(second);
        assert!(matches!(
            prefix.first_free_ip(),
            Err(IpamError::NoCapacity(_))
        ));

        let prefix = prefix.with_ip_released(first).expect("release");
        assert_eq!(prefix.first_free_ip().expect("again"), first);
        assert!(matches!(
            prefix.with_ip_released(first),
            Err(IpamError::NotAllocated(_))
        ));
    }

    #[test]
    fn usage_counts() {
        let mut prefix = Prefix::new_root(cidr("10.0.0.0/16"));
        for _ in 0..3 {
            let child = prefix.first_free_child(24).expect("child");
            prefix = prefix.with_child_allocated(&child);
        }
        let usage = prefix.usage();
        assert_eq!(usage.acquired_prefixes, 3);
        assert_eq!(usage.available_prefixes, 253);
        assert_eq!(usage.acquired_ips, 0);

        let leaf = Prefix::new_child(cidr("10.0.0.0/24"), cidr("10.0.0.0/16"));
        let ip = leaf.first_free_ip().expect("ip");
        let leaf = leaf.with_ip_allocated(ip);
        let usage = leaf.usage();
        assert_eq!(usage.available_ips, 254);
        assert_eq!(usage.acquired_ips, 1);
        assert_eq!(usage.to_string(), "ip:1/254");
    }

    #[test]
    fn serde_round_trip() {
        let prefix = Prefix::new_child(cidr("10.0.0.0/24"), cidr("10.0.0.0/16"));
        let prefix = prefix.with_ip_allocated("10.0.0.1".parse().expect("ip"));
        let json = serde_json::to_string(&prefix).expect("serialize");
        let back: Prefix = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(prefix, back);
    }
}
