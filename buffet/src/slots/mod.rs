//! Slot allocation.
//!
//! A slot is a small integer in `[0, max_sessions)`. It fixes both the
//! hypervisor display port and the public proxy port of a session. The
//! allocator keeps no state of its own: the free set is always derived from
//! the slots currently recorded in the registry.

use std::fmt;

use buffet_shared::constants::ports::VNC_DISPLAY_BASE;
use buffet_shared::errors::{BuffetError, BuffetResult};
use serde::{Deserialize, Serialize};

use crate::runtime::options::BuffetOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(u16);

impl Slot {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ports derived from a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPorts {
    pub slot: Slot,
    /// Hypervisor VNC port, local only.
    pub display_port: u16,
    /// VNC display number passed to `-vnc` (`display_port - 5900`).
    pub display_number: u16,
    /// Proxy port exposed to browsers.
    pub public_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocator {
    max_sessions: u16,
    vm_port_base: u16,
    proxy_port_base: u16,
}

impl SlotAllocator {
    /// Port bases are assumed to have passed `BuffetOptions::validate`.
    pub fn new(max_sessions: u16, vm_port_base: u16, proxy_port_base: u16) -> Self {
        Self {
            max_sessions,
            vm_port_base,
            proxy_port_base,
        }
    }

    pub fn from_options(options: &BuffetOptions) -> Self {
        Self::new(
            options.max_sessions,
            options.vm_port_base,
            options.proxy_port_base,
        )
    }

    pub fn max_sessions(&self) -> u16 {
        self.max_sessions
    }

    /// Lowest slot not in `occupied`.
    ///
    /// Occupied values outside the pool are ignored. Returns
    /// `CapacityExhausted` when every slot is taken.
    pub fn allocate<I>(&self, occupied: I) -> BuffetResult<Slot>
    where
        I: IntoIterator<Item = u16>,
    {
        self.free_slots(occupied)
            .first()
            .copied()
            .ok_or(BuffetError::CapacityExhausted {
                max: self.max_sessions,
            })
    }

    /// Free slots in ascending order.
    pub fn free_slots<I>(&self, occupied: I) -> Vec<Slot>
    where
        I: IntoIterator<Item = u16>,
    {
        let mut taken = vec![false; usize::from(self.max_sessions)];
        for index in occupied {
            if let Some(flag) = taken.get_mut(usize::from(index)) {
                *flag = true;
            }
        }
        taken
            .into_iter()
            .enumerate()
            .filter(|(_, taken)| !taken)
            .map(|(index, _)| Slot(index as u16))
            .collect()
    }

    pub fn ports(&self, slot: Slot) -> SlotPorts {
        let display_port = self.vm_port_base + slot.0;
        SlotPorts {
            slot,
            display_port,
            display_number: display_port - VNC_DISPLAY_BASE,
            public_port: self.proxy_port_base + slot.0,
        }
    }
}
