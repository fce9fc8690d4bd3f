//! CIDR block arithmetic for both address families.
//!
//! All arithmetic runs over `u128`; IPv4 addresses occupy the low 32 bits and
//! carry their own family tag so prefix lengths are interpreted against the
//! 32-bit width. Subdivisions are produced lazily so first-fit scans over
//! large spaces never materialize the full child set.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{IpamError, Result};

/// Address family of a [`Cidr`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Family {
    /// IPv4, 32-bit address space.
    V4,
    /// IPv6, 128-bit address space.
    V6,
}

impl Family {
    /// Maximum prefix length for this family.
    pub const fn max_len(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// A validated CIDR block: canonical network address plus prefix length.
///
/// Ordering is numeric by network address within a family, which makes
/// `BTreeMap<Cidr, _>` iteration the deterministic first-fit order required
/// by the allocation engine.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cidr {
    family: Family,
    base: u128,
    len: u8,
}

/// Mask covering the host bits of a block of `len` within `family`.
fn host_mask(family: Family, len: u8) -> u128 {
    let host_bits = u32::from(family.max_len() - len);
    if host_bits >= 128 {
        u128::MAX
    } else {
        (1u128 << host_bits) - 1
    }
}

pub(crate) fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub(crate) fn u128_to_ip(family: Family, value: u128) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

impl Cidr {
    /// Builds a block from an address and prefix length.
    ///
    /// The address must be the canonical network address of the block; host
    /// bits below the prefix length must be zero. A silently normalized
    /// identity key would let two spellings of one block coexist in the
    /// store, so non-canonical input is rejected instead.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        let family = match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };
        if len > family.max_len() {
            return Err(IpamError::InvalidCidr(format!(
                "/{len} exceeds /{} for {family}",
                family.max_len()
            )));
        }
        let value = ip_to_u128(addr);
        let canonical = value & !host_mask(family, len);
        if canonical != value {
            return Err(IpamError::InvalidCidr(format!(
                "{addr}/{len} has host bits set, network address is {}/{len}",
                u128_to_ip(family, canonical)
            )));
        }
        Ok(Self {
            family,
            base: value,
            len,
        })
    }

    /// Parses a canonical CIDR string such as `"10.0.0.0/16"`.
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Address family of this block.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Prefix length in bits.
    pub fn len(&self) -> u8 {
        self.len
    }

    /// The network address.
    pub fn addr(&self) -> IpAddr {
        u128_to_ip(self.family, self.base)
    }

    /// Numerically last address inside the block.
    pub(crate) fn last_address(&self) -> u128 {
        self.base | host_mask(self.family, self.len)
    }

    /// Returns `true` when `other` lies entirely inside this block.
    pub fn contains(&self, other: &Cidr) -> bool {
        self.family == other.family
            && self.len <= other.len
            && (other.base & !host_mask(self.family, self.len)) == self.base
    }

    /// Returns `true` when this block holds the given address.
    pub fn contains_ip(&self, ip: IpAddr) -> bool {
        let value = ip_to_u128(ip);
        let same_family = matches!(
            (self.family, ip),
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
        );
        same_family && (value & !host_mask(self.family, self.len)) == self.base
    }

    /// Returns `true` when the two blocks share any address.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Lazily enumerates every subdivision of this block at `len` bits, in
    /// ascending numeric order.
    ///
    /// Fails with [`IpamError::InvalidSubdivision`] unless
    /// `self.len() < len <= family max`.
    pub fn children(&self, len: u8) -> Result<Children> {
        if len <= self.len {
            return Err(IpamError::InvalidSubdivision(format!(
                "child length /{len} must be longer than /{} of {self}",
                self.len
            )));
        }
        if len > self.family.max_len() {
            return Err(IpamError::InvalidSubdivision(format!(
                "child length /{len} exceeds /{} for {}",
                self.family.max_len(),
                self.family
            )));
        }
        let step = 1u128 << u32::from(self.family.max_len() - len);
        Ok(Children {
            family: self.family,
            len,
            step,
            cur: self.base,
            last: self.last_address() - (step - 1),
            done: false,
        })
    }

    /// The individually allocatable address range as `(first, last)`.
    ///
    /// IPv4 blocks with room for hosts reserve the network and broadcast
    /// addresses; point-to-point (/31) and host (/32) blocks use every
    /// address. IPv6 reserves only the network address.
    pub(crate) fn host_range(&self) -> (u128, u128) {
        let first = self.base;
        let last = self.last_address();
        if self.len >= self.family.max_len() - 1 {
            return (first, last);
        }
        match self.family {
            Family::V4 => (first + 1, last - 1),
            Family::V6 => (first + 1, last),
        }
    }

    /// Number of individually allocatable addresses.
    pub(crate) fn usable_hosts(&self) -> u128 {
        let (first, last) = self.host_range();
        last - first + 1
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.len)
    }
}

impl fmt::Debug for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cidr({self})")
    }
}

impl FromStr for Cidr {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, len_part) = s
            .split_once('/')
            .ok_or_else(|| IpamError::InvalidCidr(format!("{s}: missing prefix length")))?;
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|e| IpamError::InvalidCidr(format!("{s}: {e}")))?;
        let len: u8 = len_part
            .parse()
            .map_err(|e| IpamError::InvalidCidr(format!("{s}: {e}")))?;
        Cidr::new(addr, len)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct CidrVisitor;

impl<'de> Visitor<'de> for CidrVisitor {
    type Value = Cidr;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a canonical CIDR string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Cidr, E> {
        Cidr::parse(v).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_str(CidrVisitor)
    }
}

/// Lazy iterator over the subdivisions of a block, ascending.
#[derive(Clone, Debug)]
pub struct Children {
    family: Family,
    len: u8,
    step: u128,
    cur: u128,
    last: u128,
    done: bool,
}

impl Iterator for Children {
    type Item = Cidr;

    fn next(&mut self) -> Option<Cidr> {
        if self.done {
            return None;
        }
        let child = Cidr {
            family: self.family,
            base: self.cur,
            len: self.len,
        };
        if self.cur == self.last {
            self.done = true;
        } else {
            self.cur += self.step;
        }
        Some(child)
    }
}
