use std::{borrow::Cow, fmt::Display, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use thiserror::Error;

pub mod bitmap;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Address {} is already allocated!", .0)]
    AddressInUse(IpAddr),
    #[error("Address {} is out of range!", .0)]
    AddressOutOfRange(IpAddr),
    #[error("The IP range for this pool was exhausted!")]
    RangeExhausted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Stored range '{}' is not a valid CIDR!", .0)]
    MalformedRange(String),
    #[error("Stored snapshot doesn't fit the allocator ({})!", .0)]
    IncompatibleSnapshot(Cow<'static, str>),
}

/// In-memory bookkeeping of a single address range.
///
/// Implementations decide which free address gets handed out next, the rest of
/// the crate only relies on the operations below.
pub trait Allocator {
    fn network(&self) -> IpNet;
    fn allocate(&mut self, ip: IpAddr) -> Result<(), AllocatorError>;
    fn allocate_next(&mut self) -> Result<IpAddr, AllocatorError>;
    /// returns `false` if the address wasn't allocated in the first place
    fn release(&mut self, ip: IpAddr) -> bool;
    fn has(&self, ip: IpAddr) -> bool;
    fn free(&self) -> usize;
    fn used(&self) -> usize;
    /// all allocated addresses, in ascending order
    fn allocated(&self) -> Vec<IpAddr>;
    /// marks every address in the range as free
    fn reset(&mut self);
}

/// Allocators able to describe their state as opaque bytes and rebuild it later.
pub trait Snapshottable {
    fn snapshot(&self) -> (IpNet, Vec<u8>);
    fn restore(&mut self, network: IpNet, data: &[u8]) -> Result<(), SnapshotError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// lowest free address first
    Sequential,
    /// scan from a random offset, wrapping around
    #[default]
    Random,
}

#[derive(Debug, Error)]
#[error("Unknown allocation strategy '{}'!", .0)]
pub struct InvalidAllocationStrategy(String);

impl FromStr for AllocationStrategy {
    type Err = InvalidAllocationStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "random" => Ok(Self::Random),
            _ => Err(InvalidAllocationStrategy(s.to_owned())),
        }
    }
}

impl Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStrategy::Sequential => f.write_str("sequential"),
            AllocationStrategy::Random => f.write_str("random"),
        }
    }
}

pub(crate) fn addr_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(ip) => u32::from(ip) as u128,
        IpAddr::V6(ip) => u128::from(ip),
    }
}
