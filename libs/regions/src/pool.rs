//! Region pool and loopback address allocation.
//!
//! Each region at index `i` is bound to `LOOPBACK_HOST:(base_port + i)` for
//! the lifetime of the pool.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::error::RegionError;
use crate::table::RegionCode;

/// First backend port when none is configured.
pub const DEFAULT_BASE_PORT: u16 = 11000;

/// Host that every backend binds to.
pub const LOOPBACK_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A region together with its index and reserved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEntry {
    pub index: usize,
    pub region: RegionCode,
    pub addr: SocketAddr,
}

/// The ordered, fixed set of regions served by one manager.
#[derive(Debug, Clone)]
pub struct RegionPool {
    regions: Arc<[RegionCode]>,
    addresses: Arc<[SocketAddr]>,
    base_port: u16,
}

impl RegionPool {
    /// Build a pool, reserving `base_port..base_port + regions.len()`.
    pub fn new(regions: Vec<RegionCode>, base_port: u16) -> Result<Self, RegionError> {
        if regions.is_empty() {
            return Err(RegionError::EmptyPool);
        }

        let mut seen = HashSet::with_capacity(regions.len());
        for region in &regions {
            if !seen.insert(*region) {
                return Err(RegionError::DuplicateRegion(region.to_string()));
            }
        }

        let last_port = usize::from(base_port) + regions.len() - 1;
        if last_port > usize::from(u16::MAX) {
            return Err(RegionError::PortRangeOverflow {
                base_port,
                count: regions.len(),
            });
        }

        let addresses: Vec<SocketAddr> = (0..regions.len())
            .map(|i| SocketAddr::new(LOOPBACK_HOST, base_port + i as u16))
            .collect();

        Ok(Self {
            regions: regions.into(),
            addresses: addresses.into(),
            base_port,
        })
    }

    /// Keep only the first `size` regions.
    pub fn truncated(&self, size: usize) -> Result<Self, RegionError> {
        if size == 0 || size > self.len() {
            return Err(RegionError::InvalidPoolSize {
                requested: size,
                available: self.len(),
            });
        }
        Self::new(self.regions[..size].to_vec(), self.base_port)
    }

    /// Number of regions (N).
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Always false; construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Regions in pool order.
    pub fn regions(&self) -> &[RegionCode] {
        &self.regions
    }

    /// Addresses in pool order, shareable with the connection router.
    pub fn addresses(&self) -> Arc<[SocketAddr]> {
        Arc::clone(&self.addresses)
    }

    /// Address reserved for the region at `index`.
    pub fn addr_of(&self, index: usize) -> Option<SocketAddr> {
        self.addresses.get(index).copied()
    }

    /// Index of a region in the pool.
    pub fn index_of(&self, region: &RegionCode) -> Option<usize> {
        self.regions.iter().position(|r| r == region)
    }

    /// Iterate over `(index, region, addr)` entries.
    pub fn entries(&self) -> impl Iterator<Item = PoolEntry> + '_ {
        self.regions
            .iter()
            .zip(self.addresses.iter())
            .enumerate()
            .map(|(index, (region, addr))| PoolEntry {
                index,
                region: *region,
                addr: *addr,
            })
    }
}
