// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-resource pool of host device addresses.

use std::collections::{BTreeSet, HashMap};

use crate::address::HostDeviceAddress;
use crate::resource::ResourceName;

/// Errors associated with pool bookkeeping.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum PoolError {
    /// Address {0} was discovered more than once.
    DuplicateAddress(HostDeviceAddress),
    /// Address {0} is not in use and cannot be released.
    NotInUse(HostDeviceAddress),
    /// No pool is registered for resource {0}.
    UnknownResource(ResourceName),
}

/// The set of addresses discovered for one resource, split between the ones that can be handed
/// out and the ones already handed out.
///
/// Addresses are handed out in discovery order. A released address goes back to the slot it was
/// discovered in, so allocating and then releasing everything leaves the pool exactly as it was
/// built, and the next allocation picks the same addresses again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressPool {
    // All addresses owned by the pool, in discovery order.
    discovered: Vec<HostDeviceAddress>,
    // Reverse lookup from address to discovery position.
    positions: HashMap<HostDeviceAddress, usize>,
    // Discovery positions of free addresses.
    available: BTreeSet<usize>,
    // Discovery positions of allocated addresses.
    in_use: BTreeSet<usize>,
}

impl AddressPool {
    /// Creates a pool where every address is available.
    ///
    /// # Arguments
    ///
    /// * `addresses` - Addresses in discovery order. The same address may not appear twice.
    pub fn new<I>(addresses: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = HostDeviceAddress>,
    {
        let discovered: Vec<_> = addresses.into_iter().collect();
        let mut positions = HashMap::with_capacity(discovered.len());

        for (position, address) in discovered.iter().enumerate() {
            if positions.insert(*address, position).is_some() {
                return Err(PoolError::DuplicateAddress(*address));
            }
        }

        Ok(Self {
            available: (0..discovered.len()).collect(),
            in_use: BTreeSet::new(),
            discovered,
            positions,
        })
    }

    /// Hands out the first available address, or `None` if the pool is exhausted.
    pub fn allocate(&mut self) -> Option<HostDeviceAddress> {
        let position = self.available.pop_first()?;
        self.in_use.insert(position);
        Some(self.discovered[position])
    }

    /// Hands out `count` addresses at once.
    ///
    /// Either all `count` addresses are allocated, or `None` is returned and the pool is left
    /// untouched.
    pub fn allocate_n(&mut self, count: usize) -> Option<Vec<HostDeviceAddress>> {
        if count > self.available.len() {
            return None;
        }

        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            // Capacity was checked above.
            let position = self.available.pop_first()?;
            self.in_use.insert(position);
            addresses.push(self.discovered[position]);
        }

        Some(addresses)
    }

    /// Returns an allocated address to the pool.
    pub fn release(&mut self, address: &HostDeviceAddress) -> Result<(), PoolError> {
        let position = self
            .positions
            .get(address)
            .copied()
            .filter(|position| self.in_use.contains(position))
            .ok_or(PoolError::NotInUse(*address))?;

        self.in_use.remove(&position);
        self.available.insert(position);
        Ok(())
    }

    /// Returns the number of available and in-use addresses.
    pub fn len(&self) -> (usize, usize) {
        (self.available.len(), self.in_use.len())
    }

    /// Returns `true` if the pool owns no address at all.
    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
    }

    /// Whether the pool owns `address`, regardless of its state.
    pub fn contains(&self, address: &HostDeviceAddress) -> bool {
        self.positions.contains_key(address)
    }

    /// Whether `address` is currently allocated.
    pub fn is_in_use(&self, address: &HostDeviceAddress) -> bool {
        self.positions
            .get(address)
            .is_some_and(|position| self.in_use.contains(position))
    }

    /// Available addresses, in the order they will be handed out.
    pub fn available(&self) -> impl Iterator<Item = &HostDeviceAddress> {
        self.available
            .iter()
            .map(|position| &self.discovered[*position])
    }

    /// Allocated addresses, in discovery order.
    pub fn in_use(&self) -> impl Iterator<Item = &HostDeviceAddress> {
        self.in_use.iter().map(|position| &self.discovered[*position])
    }

    /// All addresses owned by the pool, in discovery order.
    pub fn discovered(&self) -> &[HostDeviceAddress] {
        &self.discovered
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::address::PciAddress;

    fn addr(device: u8) -> HostDeviceAddress {
        HostDeviceAddress::Pci(PciAddress::new(0, 0x81, device, 0))
    }

    fn pool(count: u8) -> AddressPool {
        AddressPool::new((0..count).map(addr)).unwrap()
    }

    #[test]
    fn test_new_rejects_duplicates() {
        assert_eq!(
            AddressPool::new([addr(0), addr(1), addr(0)]),
            Err(PoolError::DuplicateAddress(addr(0)))
        );

        let empty = AddressPool::new([]).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.len(), (0, 0));
    }

    #[test]
    fn test_allocate_fifo() {
        let mut pool = pool(3);
        assert_eq!(pool.len(), (3, 0));
        assert_eq!(pool.allocate(), Some(addr(0)));
        assert_eq!(pool.allocate(), Some(addr(1)));
        assert_eq!(pool.allocate(), Some(addr(2)));
        assert_eq!(pool.len(), (0, 3));
        // Exhaustion is not an error, just a signal.
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.len(), (0, 3));
    }

    #[test]
    fn test_allocate_n() {
        let mut pool = pool(3);
        // Asking for nothing gives nothing and changes nothing.
        assert_eq!(pool.allocate_n(0), Some(vec![]));
        assert_eq!(pool.len(), (3, 0));

        // More than available fails without side effects.
        let before = pool.clone();
        assert_eq!(pool.allocate_n(4), None);
        assert_eq!(pool, before);

        assert_eq!(pool.allocate_n(2), Some(vec![addr(0), addr(1)]));
        assert_eq!(pool.allocate_n(2), None);
        assert_eq!(pool.allocate_n(1), Some(vec![addr(2)]));
        assert_eq!(pool.len(), (0, 3));
    }

    #[test]
    fn test_release() {
        let mut pool = pool(3);
        let taken = pool.allocate_n(2).unwrap();
        assert!(pool.is_in_use(&addr(0)));

        // Releasing something free or unknown is reported.
        assert_eq!(pool.release(&addr(2)), Err(PoolError::NotInUse(addr(2))));
        assert_eq!(pool.release(&addr(9)), Err(PoolError::NotInUse(addr(9))));
        assert_eq!(pool.len(), (1, 2));

        pool.release(&taken[1]).unwrap();
        assert_eq!(pool.release(&taken[1]), Err(PoolError::NotInUse(taken[1])));
        // Released addresses go back to their discovery slot.
        assert_eq!(
            pool.available().copied().collect::<Vec<_>>(),
            vec![addr(1), addr(2)]
        );
        assert_eq!(pool.in_use().copied().collect::<Vec<_>>(), vec![addr(0)]);

        pool.release(&taken[0]).unwrap();
        assert_eq!(pool, self::pool(3));
    }

    #[test]
    fn test_contains() {
        let mut pool = pool(2);
        assert!(pool.contains(&addr(1)));
        assert!(!pool.contains(&addr(2)));
        pool.allocate().unwrap();
        assert!(pool.contains(&addr(0)));
        assert!(!pool.is_in_use(&addr(1)));
        assert_eq!(pool.discovered(), &[addr(0), addr(1)]);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Allocate,
        AllocateN(usize),
        Release(u8),
    }

    fn random_ops() -> impl Strategy<Value = Vec<Op>> {
        let op = prop_oneof![
            Just(Op::Allocate),
            (0..6usize).prop_map(Op::AllocateN),
            (0..20u8).prop_map(Op::Release),
        ];
        prop::collection::vec(op, 0..64)
    }

    // The below prop tests validate that, for any sequence of operations:
    // - available and in-use addresses never overlap
    // - together they always cover exactly the discovered addresses
    // - a failed operation never changes the pool
    #[test]
    fn test_pool_exclusivity() {
        let cfg = ProptestConfig::with_cases(500);
        proptest!(cfg, |(size in 0..16u8, ops in random_ops())| {
            let mut pool = pool(size);
            let discovered: HashSet<_> = (0..size).map(addr).collect();

            for op in ops {
                let before = pool.clone();
                let failed = match op {
                    Op::Allocate => pool.allocate().is_none(),
                    Op::AllocateN(n) => pool.allocate_n(n).is_none(),
                    Op::Release(device) => pool.release(&addr(device)).is_err(),
                };
                if failed {
                    prop_assert_eq!(&pool, &before);
                }

                let available: HashSet<_> = pool.available().copied().collect();
                let in_use: HashSet<_> = pool.in_use().copied().collect();
                prop_assert!(available.is_disjoint(&in_use));
                prop_assert_eq!(
                    available.union(&in_use).copied().collect::<HashSet<_>>(),
                    discovered.clone()
                );
                prop_assert_eq!(pool.len(), (available.len(), in_use.len()));
            }
        });
    }

    #[test]
    fn test_pool_round_trip() {
        let cfg = ProptestConfig::with_cases(500);
        proptest!(cfg, |(size in 0..16u8, taken in 0..8usize, count in 0..8usize)| {
            let mut pool = pool(size);
            // Start from an arbitrary partially used state.
            let _ = pool.allocate_n(taken);
            let before = pool.clone();

            if let Some(addresses) = pool.allocate_n(count) {
                for address in addresses.iter().rev() {
                    pool.release(address).unwrap();
                }
            }
            prop_assert_eq!(pool, before);
        });
    }
}
