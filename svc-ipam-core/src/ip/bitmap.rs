use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use rand::Rng;

use super::{
    addr_to_u128, AllocationStrategy, Allocator, AllocatorError, SnapshotError, Snapshottable,
};

/// IPv6 ranges are huge, only the first 2^16 hosts are handed out
const MAX_IPV6_RANGE_SIZE: u64 = 1 << 16;

/// One bit per allocatable address of the range.
///
/// For IPv4 ranges larger than /31 the network and broadcast addresses are never
/// handed out, for IPv6 the subnet-router anycast (network) address is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapAllocator {
    network: IpNet,
    strategy: AllocationStrategy,
    base: u128,
    size: usize,
    bits: Vec<u8>,
    count: usize,
}

impl BitmapAllocator {
    pub fn new(network: IpNet, strategy: AllocationStrategy) -> Self {
        let network = network.trunc();
        let (base, size) = match network {
            IpNet::V4(net) => {
                let total = 1u64 << (32 - net.prefix_len());
                let first = u32::from(net.network()) as u128;

                match total > 2 {
                    true => (first + 1, total - 2),
                    false => (first, total),
                }
            }
            IpNet::V6(net) => {
                let host_bits = 128 - net.prefix_len();
                let total = match host_bits >= 64 {
                    true => u64::MAX,
                    false => 1u64 << host_bits,
                };
                let first = u128::from(net.network());

                match total > 1 {
                    true => (first + 1, (total - 1).min(MAX_IPV6_RANGE_SIZE)),
                    false => (first, total),
                }
            }
        };
        let size = size as usize;

        Self {
            network,
            strategy,
            base,
            size,
            bits: vec![0; size.div_ceil(8)],
            count: 0,
        }
    }

    /// number of allocatable addresses
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    fn offset_of(&self, ip: IpAddr) -> Option<usize> {
        if ip.is_ipv4() != self.network.addr().is_ipv4() {
            return None;
        }

        let value = addr_to_u128(ip);

        if value < self.base || value - self.base >= self.size as u128 {
            return None;
        }

        Some((value - self.base) as usize)
    }

    fn address_at(&self, offset: usize) -> IpAddr {
        let value = self.base + offset as u128;

        match self.network {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }

    fn is_set(&self, offset: usize) -> bool {
        self.bits[offset / 8] & (1 << (offset % 8)) != 0
    }

    fn set(&mut self, offset: usize) {
        self.bits[offset / 8] |= 1 << (offset % 8);
        self.count += 1;
    }

    fn clear(&mut self, offset: usize) {
        self.bits[offset / 8] &= !(1 << (offset % 8));
        self.count -= 1;
    }

    fn first_free_from(&self, start: usize) -> Option<usize> {
        (start..self.size)
            .chain(0..start)
            .find(|offset| !self.is_set(*offset))
    }
}

impl Allocator for BitmapAllocator {
    fn network(&self) -> IpNet {
        self.network
    }

    fn allocate(&mut self, ip: IpAddr) -> Result<(), AllocatorError> {
        let offset = self
            .offset_of(ip)
            .ok_or(AllocatorError::AddressOutOfRange(ip))?;

        if self.is_set(offset) {
            return Err(AllocatorError::AddressInUse(ip));
        }

        self.set(offset);

        Ok(())
    }

    fn allocate_next(&mut self) -> Result<IpAddr, AllocatorError> {
        if self.count >= self.size {
            return Err(AllocatorError::RangeExhausted);
        }

        let start = match self.strategy {
            AllocationStrategy::Sequential => 0,
            AllocationStrategy::Random => rand::thread_rng().gen_range(0..self.size),
        };
        let offset = self
            .first_free_from(start)
            .ok_or(AllocatorError::RangeExhausted)?;

        self.set(offset);

        Ok(self.address_at(offset))
    }

    fn release(&mut self, ip: IpAddr) -> bool {
        match self.offset_of(ip) {
            Some(offset) if self.is_set(offset) => {
                self.clear(offset);
                true
            }
            _ => false,
        }
    }

    fn has(&self, ip: IpAddr) -> bool {
        self.offset_of(ip)
            .map(|offset| self.is_set(offset))
            .unwrap_or(false)
    }

    fn free(&self) -> usize {
        self.size - self.count
    }

    fn used(&self) -> usize {
        self.count
    }

    fn allocated(&self) -> Vec<IpAddr> {
        (0..self.size)
            .filter(|offset| self.is_set(*offset))
            .map(|offset| self.address_at(offset))
            .collect()
    }

    fn reset(&mut self) {
        self.bits.iter_mut().for_each(|byte| *byte = 0);
        self.count = 0;
    }
}

impl Snapshottable for BitmapAllocator {
    fn snapshot(&self) -> (IpNet, Vec<u8>) {
        (self.network, self.bits.clone())
    }

    fn restore(&mut self, network: IpNet, data: &[u8]) -> Result<(), SnapshotError> {
        if network.trunc() != self.network {
            return Err(SnapshotError::IncompatibleSnapshot(
                format!(
                    "snapshot covers {network}, the allocator manages {}",
                    self.network
                )
                .into(),
            ));
        }

        if data.len() != self.bits.len() {
            return Err(SnapshotError::IncompatibleSnapshot(
                format!(
                    "expected {} bytes of usage data, got {}",
                    self.bits.len(),
                    data.len()
                )
                .into(),
            ));
        }

        let trailing_bits = self.bits.len() * 8 - self.size;
        if trailing_bits > 0 {
            let last = data[data.len() - 1];
            if last >> (8 - trailing_bits) != 0 {
                return Err(SnapshotError::IncompatibleSnapshot(
                    "usage data marks addresses beyond the end of the range".into(),
                ));
            }
        }

        self.bits.copy_from_slice(data);
        self.count = self.bits.iter().map(|byte| byte.count_ones() as usize).sum();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use ipnet::IpNet;

    use crate::ip::{AllocationStrategy, Allocator, AllocatorError, SnapshotError, Snapshottable};

    use super::BitmapAllocator;

    fn allocator(net_raw: &str) -> BitmapAllocator {
        BitmapAllocator::new(net_raw.parse().unwrap(), AllocationStrategy::Sequential)
    }

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn bitmap_allocator_skips_network_and_broadcast_addresses() {
        let mut allocator = allocator("10.0.0.0/29");

        assert_eq!(allocator.size(), 6);
        assert_eq!(allocator.allocate(ip("10.0.0.0")), Err(AllocatorError::AddressOutOfRange(ip("10.0.0.0"))));
        assert_eq!(allocator.allocate(ip("10.0.0.7")), Err(AllocatorError::AddressOutOfRange(ip("10.0.0.7"))));

        let handed_out = (0..6)
            .map(|_| allocator.allocate_next().unwrap())
            .collect::<Vec<_>>();
        let expected = (1..=6)
            .map(|i| ip(&format!("10.0.0.{i}")))
            .collect::<Vec<_>>();

        assert_eq!(handed_out, expected);
        assert_eq!(allocator.allocate_next(), Err(AllocatorError::RangeExhausted));
    }

    #[test]
    fn bitmap_allocator_keeps_tiny_ranges_whole() {
        assert_eq!(allocator("10.0.0.4/31").size(), 2);
        assert_eq!(allocator("10.0.0.4/32").size(), 1);
        assert_eq!(allocator("fd00::/120").size(), 255);
        assert_eq!(allocator("fd00::/64").size(), 1 << 16);
    }

    #[test]
    fn bitmap_allocator_rejects_double_allocation() {
        let mut allocator = allocator("192.168.1.0/24");

        allocator.allocate(ip("192.168.1.10")).unwrap();

        assert_eq!(
            allocator.allocate(ip("192.168.1.10")),
            Err(AllocatorError::AddressInUse(ip("192.168.1.10")))
        );
        assert_eq!(
            allocator.allocate(ip("fd00::1")),
            Err(AllocatorError::AddressOutOfRange(ip("fd00::1")))
        );
        assert!(allocator.release(ip("192.168.1.10")));
        assert!(!allocator.release(ip("192.168.1.10")));
        assert_eq!(allocator.used(), 0);
    }

    #[test]
    fn random_strategy_hands_out_every_address_once() {
        let mut allocator =
            BitmapAllocator::new("10.13.2.0/27".parse().unwrap(), AllocationStrategy::Random);
        let mut handed_out = (0..allocator.size())
            .map(|_| allocator.allocate_next().unwrap())
            .collect::<Vec<_>>();

        handed_out.sort_unstable();
        handed_out.dedup();

        assert_eq!(handed_out.len(), 30);
        assert_eq!(allocator.free(), 0);
        assert_eq!(allocator.allocated(), handed_out);
    }

    #[test]
    fn restore_reproduces_the_snapshotted_state() {
        let mut original = allocator("10.0.0.0/24");
        for raw in ["10.0.0.1", "10.0.0.77", "10.0.0.254"] {
            original.allocate(ip(raw)).unwrap();
        }

        let (network, data) = original.snapshot();
        let mut restored = allocator("10.0.0.0/24");
        restored.restore(network, &data).unwrap();

        assert_eq!(restored, original);
        assert!(restored.has(ip("10.0.0.77")));
        assert!(!restored.has(ip("10.0.0.78")));
        assert_eq!(restored.free(), 251);
    }

    #[test]
    fn restore_rejects_snapshots_of_other_shapes() {
        let mut allocator = allocator("10.0.0.0/24");
        let other: IpNet = "10.0.1.0/24".parse().unwrap();
        let own: IpNet = "10.0.0.0/24".parse().unwrap();

        assert!(matches!(
            allocator.restore(other, &[0; 32]),
            Err(SnapshotError::IncompatibleSnapshot(_))
        ));
        assert!(matches!(
            allocator.restore(own, &[0; 16]),
            Err(SnapshotError::IncompatibleSnapshot(_))
        ));

        // 254 addresses leave the two highest bits of the last byte unused
        let mut data = vec![0; 32];
        data[31] = 0b1000_0000;

        assert!(matches!(
            allocator.restore(own, &data),
            Err(SnapshotError::IncompatibleSnapshot(_))
        ));
        assert_eq!(allocator.used(), 0);
    }
}
