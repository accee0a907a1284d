//! Private address management for isolated instances.
//!
//! Every networked sandbox receives one address out of a configured IPv4 block.
//! Leases are RAII values: dropping an [`AddressLease`] hands the address back.

mod allocator;

pub use allocator::{AddressAllocator, AddressLease};
