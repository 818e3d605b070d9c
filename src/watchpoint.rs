//! Data-access stoppoints backed by a debug register slot.

use crate::error::{Error, Result};
use crate::stoppoint::{Stoppoint, StoppointId};
use crate::types::{StoppointMode, VirtAddr};

#[derive(Debug)]
pub struct Watchpoint {
    id: StoppointId,
    address: VirtAddr,
    mode: StoppointMode,
    size: usize,
    is_enabled: bool,
    hardware_index: Option<usize>,
    data: Option<u64>,
    previous_data: Option<u64>,
}

impl Watchpoint {
    pub(crate) fn new(
        id: StoppointId,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<Self> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(Error::InvalidStoppoint {
                reason: "watchpoint size must be 1, 2, 4, or 8 bytes",
            });
        }
        // the debug registers only match size-aligned addresses
        if address.addr() & (size as u64 - 1) != 0 {
            return Err(Error::InvalidStoppoint {
                reason: "watchpoint address must be aligned to its size",
            });
        }

        Ok(Self {
            id,
            address,
            mode,
            size,
            is_enabled: false,
            hardware_index: None,
            data: None,
            previous_data: None,
        })
    }

    pub fn mode(&self) -> StoppointMode {
        self.mode
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Value observed at the watched address on the most recent stop
    /// attributed to this watchpoint (or at enable time).
    pub fn data(&self) -> Option<u64> {
        self.data
    }

    /// The value before the most recent update, for "was X, now Y".
    pub fn previous_data(&self) -> Option<u64> {
        self.previous_data
    }

    pub fn at_address(&self, address: VirtAddr) -> bool {
        self.address == address
    }

    pub fn in_range(&self, low: VirtAddr, high: VirtAddr) -> bool {
        low <= self.address && self.address <= high
    }

    pub(crate) fn hardware_index(&self) -> Option<usize> {
        self.hardware_index
    }

    pub(crate) fn update_data(&mut self, current: u64) {
        self.previous_data = self.data;
        self.data = Some(current);
    }

    pub(crate) fn mark_enabled(&mut self, slot: usize) {
        self.hardware_index = Some(slot);
        self.is_enabled = true;
    }

    pub(crate) fn mark_disabled(&mut self) {
        self.hardware_index = None;
        self.is_enabled = false;
    }
}

impl Stoppoint for Watchpoint {
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
