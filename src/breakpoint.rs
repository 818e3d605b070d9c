//! Breakpoint sites: a single installation point at a virtual address.
//!
//! A software site patches an `int3` over the first byte of the target
//! instruction and keeps the original byte for restore and for transparent
//! memory reads. A hardware site occupies one debug register slot instead.
//! The kernel-facing half of enable/disable lives on
//! [`Process`](crate::process::Process), which owns the site.

use crate::stoppoint::{Stoppoint, StoppointId};
use crate::types::VirtAddr;

/// x86 `int3` opcode.
pub(crate) const INT3: u8 = 0xcc;

#[derive(Debug)]
pub struct BreakpointSite {
    id: StoppointId,
    address: VirtAddr,
    is_enabled: bool,
    is_hardware: bool,
    is_internal: bool,
    saved_data: Option<u8>,
    hardware_index: Option<usize>,
}

impl BreakpointSite {
    pub(crate) fn new(
        id: StoppointId,
        address: VirtAddr,
        is_hardware: bool,
        is_internal: bool,
    ) -> Self {
        Self {
            id,
            address,
            is_enabled: false,
            is_hardware,
            is_internal,
            saved_data: None,
            hardware_index: None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.is_hardware
    }

    /// Engine-placed sites are never reported to callers.
    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn at_address(&self, address: VirtAddr) -> bool {
        self.address == address
    }

    pub fn in_range(&self, low: VirtAddr, high: VirtAddr) -> bool {
        low <= self.address && self.address <= high
    }

    /// The original byte displaced by the `int3` patch.
    pub(crate) fn saved_data(&self) -> Option<u8> {
        self.saved_data
    }

    pub(crate) fn hardware_index(&self) -> Option<usize> {
        self.hardware_index
    }

    pub(crate) fn mark_enabled_software(&mut self, saved: u8) {
        self.saved_data = Some(saved);
        self.is_enabled = true;
    }

    pub(crate) fn mark_enabled_hardware(&mut self, slot: usize) {
        self.hardware_index = Some(slot);
        self.is_enabled = true;
    }

    pub(crate) fn mark_disabled(&mut self) {
        self.saved_data = None;
        self.hardware_index = None;
        self.is_enabled = false;
    }
}

impl Stoppoint for BreakpointSite {
    fn id(&self) -> StoppointId {
        self.id
    }

    fn address(&self) -> VirtAddr {
        self.address
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_state_bookkeeping() {
        let mut site = BreakpointSite::new(1, VirtAddr::new(0x401000), false, false);
        assert!(!site.is_enabled());
        assert!(site.saved_data().is_none());

        site.mark_enabled_software(0x55);
        assert!(site.is_enabled());
        assert_eq!(site.saved_data(), Some(0x55));

        site.mark_disabled();
        assert!(!site.is_enabled());
        assert!(site.saved_data().is_none());
    }

    #[test]
    fn range_membership() {
        let site = BreakpointSite::new(1, VirtAddr::new(0x401010), false, false);
        assert!(site.at_address(VirtAddr::new(0x401010)));
        assert!(site.in_range(VirtAddr::new(0x401000), VirtAddr::new(0x401010)));
        assert!(!site.in_range(VirtAddr::new(0x401011), VirtAddr::new(0x402000)));
    }
}
