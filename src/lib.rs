//! Hierarchical CIDR and IP address allocation engine.
//!
//! `cidralloc` tracks CIDR blocks and the addresses inside them, handing out
//! child blocks and individual addresses first-fit while guaranteeing that no
//! resource is ever allocated twice, even when many independent actors race
//! against the same parent through a shared, possibly-stale-read store.
//! Coordination uses no distributed lock: every mutation is a pure
//! compute-candidate step followed by a version-checked write, retried
//! against fresh state on conflict.
//!
//! ```rust
//! use cidralloc::{Ipam, OpContext};
//!
//! let ipam = Ipam::memory();
//! let ctx = OpContext::background();
//!
//! ipam.new_prefix(&ctx, "10.0.0.0/16")?;
//! let child = ipam.acquire_child_prefix(&ctx, "10.0.0.0/16", 24)?;
//! let ip = ipam.acquire_ip(&ctx, &child.cidr().to_string())?;
//!
//! assert_eq!(child.cidr().to_string(), "10.0.0.0/24");
//! assert_eq!(ip.to_string(), "10.0.0.1");
//! # Ok::<(), cidralloc::IpamError>(())
//! ```
//!
//! Persistence is pluggable through the [`Storage`] trait; the bundled
//! [`InMemoryStorage`] is the reference backend, and any store offering an
//! atomic conditional write can be dropped in with identical semantics.

pub mod cidr;
pub mod error;
pub mod ipam;
pub mod model;
pub mod storage;

pub use cidr::{Children, Cidr, Family};
pub use error::{IpamError, Result};
pub use ipam::{CancelToken, Ipam, OpContext, RetryConfig};
pub use model::{Prefix, Usage};
pub use storage::{InMemoryStorage, Storage};
