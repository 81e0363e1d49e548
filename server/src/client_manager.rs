//! Fixed-size slot table for connected clients
//!
//! Slots 1..=N are created up front and never destroyed; connections are
//! bound into them and released again. Each slot guards its own transport
//! fields, so assignment, teardown and datagram routing on different slots
//! never contend with each other.

use crate::client::{DatagramVerdict, Slot, StreamHandle};
use log::info;
use std::net::SocketAddr;

pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    /// Creates slots with ids `1..=capacity`
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (1..=capacity).map(Slot::new).collect(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn get(&self, id: u32) -> Option<&Slot> {
        id.checked_sub(1).and_then(|i| self.slots.get(i as usize))
    }

    /// Binds a new stream connection to the lowest free slot.
    ///
    /// Returns `None` when every slot is taken; nothing is modified then.
    pub fn claim_stream(&self, handle: &StreamHandle) -> Option<u32> {
        let slot = self.slots.iter().find(|slot| slot.try_bind_stream(handle))?;
        info!("Slot {} assigned to {}", slot.id(), handle.peer());
        Some(slot.id())
    }

    /// Tears down both transports of a slot
    pub fn release(&self, id: u32) -> bool {
        self.get(id).and_then(|slot| slot.release()).is_some()
    }

    /// Routes an inbound datagram's claimed slot id through the endpoint
    /// binding check. An accepted verdict carries the validated slot id.
    pub fn check_datagram(&self, claimed: i32, from: SocketAddr) -> DatagramVerdict {
        match u32::try_from(claimed).ok().and_then(|id| self.get(id)) {
            Some(slot) => slot.check_datagram(from),
            None => DatagramVerdict::UnknownSlot,
        }
    }

    pub fn stream_handle(&self, id: u32) -> Option<StreamHandle> {
        self.get(id).and_then(Slot::stream_handle)
    }

    pub fn datagram_endpoint(&self, id: u32) -> Option<SocketAddr> {
        self.get(id).and_then(Slot::datagram_endpoint)
    }

    /// Ids of slots with a bound stream connection
    pub fn connected(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|slot| slot.has_stream())
            .map(Slot::id)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.has_stream()).count()
    }
}
