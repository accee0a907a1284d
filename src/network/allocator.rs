//! Forward-scanning address allocator.
//!
//! Addresses are tracked as offsets into the subnet, so octet carries come for free
//! from integer arithmetic. The scan pointer only ever moves forward and wraps at the
//! end of the block; releasing an address does not rewind it. A freed address is
//! therefore handed out again only after the pointer has gone all the way round,
//! which keeps recently used addresses out of circulation (stale ARP entries,
//! lingering connections) for as long as possible.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{MAX_PREFIX_LEN, MIN_PREFIX_LEN, NetworkConfig, prefix_mask};
use crate::error::SandboxError;

#[derive(Debug)]
struct AllocatorState {
    /// Network address (base with host bits cleared).
    network: u32,
    /// Number of addresses in the block, including network and broadcast.
    size: u32,
    /// Offset of the most recently considered address.
    cursor: u32,
    reserved: HashSet<u32>,
    leased: HashSet<u32>,
    base: Ipv4Addr,
    prefix_len: u8,
}

impl AllocatorState {
    /// Moves the cursor one step, skipping the network (0) and broadcast (size - 1) offsets.
    fn advance(&mut self) -> u32 {
        self.cursor += 1;
        if self.cursor >= self.size - 1 {
            self.cursor = 1;
        }
        self.cursor
    }

    fn usable(&self) -> u32 {
        self.size.saturating_sub(2)
    }

    fn addr(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.network.wrapping_add(offset))
    }

    fn offset(&self, addr: Ipv4Addr) -> Option<u32> {
        let raw = u32::from(addr);
        let offset = raw.wrapping_sub(self.network);
        (offset < self.size).then_some(offset)
    }
}

/// Hands out unique addresses from a private block.
///
/// Cloning is cheap; clones share the same leased set.
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl AddressAllocator {
    /// Creates an allocator over `config`'s block.
    ///
    /// The base address and the gateway are always reserved, in addition to the
    /// configured reserved list. A prefix length outside `8..=30` is clamped into it.
    #[must_use]
    pub fn new(config: &NetworkConfig) -> Self {
        let prefix_len = config.prefix_len.clamp(MIN_PREFIX_LEN, MAX_PREFIX_LEN);
        if prefix_len != config.prefix_len {
            warn!(
                configured = config.prefix_len,
                prefix_len,
                "Prefix length out of range, clamping"
            );
        }
        let mask = prefix_mask(prefix_len);
        let network = u32::from(config.base) & mask;
        let size = !mask + 1;

        let mut state = AllocatorState {
            network,
            size,
            cursor: 0,
            reserved: HashSet::new(),
            leased: HashSet::new(),
            base: config.base,
            prefix_len,
        };

        state.cursor = state.offset(config.base).unwrap_or(0);
        for addr in config
            .reserved
            .iter()
            .chain([&config.base, &config.gateway])
        {
            match state.offset(*addr) {
                Some(offset) => {
                    state.reserved.insert(offset);
                }
                None => warn!(%addr, "Reserved address outside the pool, ignoring"),
            }
        }

        debug!(
            network = %Ipv4Addr::from(network),
            prefix_len,
            reserved = state.reserved.len(),
            "Address allocator initialized"
        );

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Leases the next free address after the scan pointer.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::AddressExhausted` when every usable address is reserved
    /// or leased.
    pub fn acquire(&self) -> Result<AddressLease, SandboxError> {
        let mut state = self.state.lock();

        for _ in 0..state.usable() {
            let offset = state.advance();
            if state.reserved.contains(&offset) || state.leased.contains(&offset) {
                continue;
            }
            state.leased.insert(offset);
            let addr = state.addr(offset);
            trace!(%addr, leased = state.leased.len(), "Address leased");
            return Ok(AddressLease {
                addr,
                allocator: Some(self.clone()),
            });
        }

        Err(SandboxError::AddressExhausted {
            base: state.base,
            prefix_len: state.prefix_len,
        })
    }

    /// Clears the leased mark. Does not move the scan pointer.
    fn release(&self, addr: Ipv4Addr) {
        let mut state = self.state.lock();
        let offset = state.offset(addr);
        let removed = offset.is_some_and(|offset| state.leased.remove(&offset));
        if removed {
            trace!(%addr, leased = state.leased.len(), "Address released");
        } else {
            warn!(%addr, "Released an address that was not leased");
        }
    }

    /// Returns `true` if `addr` is currently leased.
    #[must_use]
    pub fn is_leased(&self, addr: Ipv4Addr) -> bool {
        let state = self.state.lock();
        state
            .offset(addr)
            .is_some_and(|offset| state.leased.contains(&offset))
    }

    /// Number of live leases.
    #[must_use]
    pub fn leased_count(&self) -> usize {
        self.state.lock().leased.len()
    }

    /// Number of addresses that can ever be leased.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let state = self.state.lock();
        let usable = state.usable() as usize;
        let reserved_usable = state
            .reserved
            .iter()
            .filter(|&&offset| offset > 0 && offset < state.size - 1)
            .count();
        usable - reserved_usable
    }
}

/// A leased address. Dropping the lease releases the address exactly once.
#[derive(Debug)]
pub struct AddressLease {
    addr: Ipv4Addr,
    allocator: Option<AddressAllocator>,
}

impl AddressLease {
    /// The leased address.
    #[must_use]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Returns the address to the pool now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            allocator.release(self.addr);
        }
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(base: [u8; 4], prefix_len: u8, gateway: [u8; 4]) -> NetworkConfig {
        NetworkConfig {
            base: Ipv4Addr::from(base),
            prefix_len,
            gateway: Ipv4Addr::from(gateway),
            reserved: Vec::new(),
            bridge: String::from("lxcbr0"),
        }
    }

    #[test]
    fn test_sequential_acquire_skips_gateway() {
        let allocator = AddressAllocator::new(&network([10, 0, 3, 0], 24, [10, 0, 3, 1]));

        let a = allocator.acquire().expect("lease a");
        let b = allocator.acquire().expect("lease b");

        assert_eq!(a.addr(), Ipv4Addr::new(10, 0, 3, 2));
        assert_eq!(b.addr(), Ipv4Addr::new(10, 0, 3, 3));
        assert_eq!(allocator.leased_count(), 2);
    }

    #[test]
    fn test_reserved_addresses_skipped() {
        let mut config = network([10, 0, 3, 0], 24, [10, 0, 3, 1]);
        config.reserved = vec![Ipv4Addr::new(10, 0, 3, 2), Ipv4Addr::new(10, 0, 3, 3)];
        let allocator = AddressAllocator::new(&config);

        let lease = allocator.acquire().expect("lease");
        assert_eq!(lease.addr(), Ipv4Addr::new(10, 0, 3, 4));
    }

    #[test]
    fn test_prefix_out_of_range_is_clamped() {
        let mut config = network([10, 0, 3, 0], 0, [10, 0, 3, 1]);
        config.reserved = vec![Ipv4Addr::new(10, 0, 3, 2)];
        let allocator = AddressAllocator::new(&config);

        // a /8: 2^24 addresses minus network, broadcast, base, gateway and the reserved one
        assert_eq!(allocator.capacity(), (1 << 24) - 5);
        let lease = allocator.acquire().expect("lease");
        assert_eq!(lease.addr(), Ipv4Addr::new(10, 0, 3, 3));

        let allocator = AddressAllocator::new(&network([10, 0, 3, 0], 32, [10, 0, 3, 1]));
        assert_eq!(allocator.capacity(), 1);
        let lease = allocator.acquire().expect("lease");
        assert_eq!(lease.addr(), Ipv4Addr::new(10, 0, 3, 2));
        assert!(allocator.acquire().is_err());
    }

    #[test]
    fn test_carry_across_octets() {
        let allocator = AddressAllocator::new(&network([10, 1, 0, 254], 16, [10, 1, 0, 1]));

        let a = allocator.acquire().expect("lease a");
        let b = allocator.acquire().expect("lease b");

        assert_eq!(a.addr(), Ipv4Addr::new(10, 1, 0, 255));
        assert_eq!(b.addr(), Ipv4Addr::new(10, 1, 1, 0));
    }

    #[test]
    fn test_exhaustion() {
        // /30: offsets 1 and 2 usable; base (0) is network, gateway takes 1
        let allocator = AddressAllocator::new(&network([10, 0, 0, 0], 30, [10, 0, 0, 1]));
        assert_eq!(allocator.capacity(), 1);

        let _only = allocator.acquire().expect("one address available");
        let result = allocator.acquire();
        assert!(matches!(result, Err(SandboxError::AddressExhausted { .. })));
    }

    #[test]
    fn test_drop_releases_exactly_once() {
        let allocator = AddressAllocator::new(&network([10, 0, 3, 0], 24, [10, 0, 3, 1]));

        let lease = allocator.acquire().expect("lease");
        let addr = lease.addr();
        assert!(allocator.is_leased(addr));

        drop(lease);
        assert!(!allocator.is_leased(addr));
        assert_eq!(allocator.leased_count(), 0);
    }

    #[test]
    fn test_release_does_not_rewind() {
        let allocator = AddressAllocator::new(&network([10, 0, 3, 0], 24, [10, 0, 3, 1]));

        let first = allocator.acquire().expect("lease");
        let first_addr = first.addr();
        first.release();

        let next = allocator.acquire().expect("lease");
        assert_ne!(next.addr(), first_addr);
        assert_eq!(next.addr(), Ipv4Addr::new(10, 0, 3, 3));
    }

    #[test]
    fn test_released_address_reused_after_wrap() {
        // /29: offsets 1..=6 usable, gateway at offset 1 leaves 5 leasable addresses
        let allocator = AddressAllocator::new(&network([10, 0, 0, 0], 29, [10, 0, 0, 1]));
        assert_eq!(allocator.capacity(), 5);

        let first = allocator.acquire().expect("lease");
        let first_addr = first.addr();
        first.release();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let lease = allocator.acquire().expect("lease");
            assert_ne!(lease.addr(), first_addr);
            seen.push(lease.addr());
        }

        // the pointer wraps and lands on the released address again
        let again = allocator.acquire().expect("lease");
        assert_eq!(again.addr(), first_addr);
    }

    #[test]
    fn test_never_returns_leased_address() {
        let allocator = AddressAllocator::new(&network([10, 0, 0, 0], 28, [10, 0, 0, 1]));
        let mut live = Vec::new();
        for round in 0..50 {
            if round % 3 == 2 && !live.is_empty() {
                live.remove(0);
            }
            match allocator.acquire() {
                Ok(lease) => {
                    assert!(
                        live.iter().all(|l: &AddressLease| l.addr() != lease.addr()),
                        "address {} handed out twice",
                        lease.addr()
                    );
                    live.push(lease);
                }
                Err(SandboxError::AddressExhausted { .. }) => {
                    live.remove(0);
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
