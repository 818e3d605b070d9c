//! Ordered, id-keyed storage shared by breakpoint sites and watchpoints.

use crate::error::{Error, Result};
use crate::types::VirtAddr;

pub type StoppointId = u32;

/// Anything that can halt the inferior at a known address.
pub trait Stoppoint {
    fn id(&self) -> StoppointId;
    fn address(&self) -> VirtAddr;
    fn is_enabled(&self) -> bool;
}

/// Stoppoints for one process, kept in increasing address order.
///
/// The collection only stores; installing and removing the kernel side of a
/// stoppoint is the owning process's job.
#[derive(Debug, Default)]
pub struct StoppointCollection<T> {
    items: Vec<T>,
}

impl<T: Stoppoint> StoppointCollection<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Insert a stoppoint, rejecting duplicate addresses. Duplicate ids
    /// cannot come from the id counter and mean engine corruption.
    pub fn push(&mut self, stoppoint: T) -> Result<&mut T> {
        if self.contains_id(stoppoint.id()) {
            internal_error!("duplicate stoppoint id = {}", stoppoint.id());
        }
        if self.contains_address(stoppoint.address()) {
            return Err(Error::StoppointExists {
                address: stoppoint.address(),
            });
        }

        let at = self
            .items
            .partition_point(|item| item.address() < stoppoint.address());
        self.items.insert(at, stoppoint);
        Ok(&mut self.items[at])
    }

    pub fn remove_by_id(&mut self, id: StoppointId) -> Result<T> {
        let at = self
            .items
            .iter()
            .position(|item| item.id() == id)
            .ok_or(Error::StoppointNotFound { id })?;
        Ok(self.items.remove(at))
    }

    pub fn get_by_id(&self, id: StoppointId) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn get_by_id_mut(&mut self, id: StoppointId) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.id() == id)
    }

    pub fn get_by_address(&self, address: VirtAddr) -> Option<&T> {
        self.items.iter().find(|item| item.address() == address)
    }

    pub fn get_by_address_mut(&mut self, address: VirtAddr) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.address() == address)
    }

    pub fn contains_id(&self, id: StoppointId) -> bool {
        self.get_by_id(id).is_some()
    }

    pub fn contains_address(&self, address: VirtAddr) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn enabled_stoppoint_at_address(&self, address: VirtAddr) -> bool {
        self.get_by_address(address)
            .map(Stoppoint::is_enabled)
            .unwrap_or(false)
    }

    /// Stoppoints whose address falls in `[low, high]`, in increasing
    /// address order.
    pub fn get_in_range(&self, low: VirtAddr, high: VirtAddr) -> impl Iterator<Item = &T> {
        self.items
            .iter()
            .filter(move |item| low <= item.address() && item.address() <= high)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestPoint {
        id: StoppointId,
        address: VirtAddr,
        enabled: bool,
    }

    impl TestPoint {
        fn new(id: StoppointId, address: u64) -> Self {
            Self {
                id,
                address: VirtAddr::new(address),
                enabled: false,
            }
        }
    }

    impl Stoppoint for TestPoint {
        fn id(&self) -> StoppointId {
            self.id
        }

        fn address(&self) -> VirtAddr {
            self.address
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }
    }

    #[test]
    fn push_rejects_duplicate_addresses() {
        let mut collection = StoppointCollection::new();
        collection.push(TestPoint::new(1, 0x1000)).unwrap();

        let err = collection.push(TestPoint::new(2, 0x1000)).unwrap_err();
        assert!(matches!(err, Error::StoppointExists { .. }));
        assert_eq!(collection.len(), 1);
    }

    #[test]
    fn lookups() {
        let mut collection = StoppointCollection::new();
        collection.push(TestPoint::new(1, 0x2000)).unwrap();
        collection.push(TestPoint::new(2, 0x1000)).unwrap();

        assert_eq!(collection.get_by_id(2).unwrap().address(), VirtAddr::new(0x1000));
        assert!(collection.get_by_id(3).is_none());
        assert!(collection.contains_address(VirtAddr::new(0x2000)));
        assert!(!collection.enabled_stoppoint_at_address(VirtAddr::new(0x2000)));

        collection.get_by_id_mut(1).unwrap().enabled = true;
        assert!(collection.enabled_stoppoint_at_address(VirtAddr::new(0x2000)));
    }

    #[test]
    fn range_queries_come_back_in_address_order() {
        let mut collection = StoppointCollection::new();
        for (id, address) in [(1, 0x3000u64), (2, 0x1000), (3, 0x2000), (4, 0x4000)] {
            collection.push(TestPoint::new(id, address)).unwrap();
        }

        let in_range: Vec<u64> = collection
            .get_in_range(VirtAddr::new(0x1000), VirtAddr::new(0x3000))
            .map(|point| point.address().addr())
            .collect();
        assert_eq!(in_range, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn remove_by_id() {
        let mut collection = StoppointCollection::new();
        collection.push(TestPoint::new(1, 0x1000)).unwrap();

        assert!(collection.remove_by_id(1).is_ok());
        assert!(collection.is_empty());
        assert!(matches!(
            collection.remove_by_id(1),
            Err(Error::StoppointNotFound { id: 1 })
        ));
    }
}
