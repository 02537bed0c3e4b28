//! Execution slots and the bounded slot pool
//!
//! A [`Slot`] owns one native inference request plus the inference units
//! currently batched into it. The [`SlotPool`] holds the free slots; it is
//! the only structure shared between the submitting thread and the runtime's
//! completion thread, so it is a lock-free bounded queue.

use crate::task::InferenceUnit;
use crossbeam::queue::ArrayQueue;
use framebatch_common::METRICS;
use tracing::{error, trace};

/// Stable slot identifier, used in logs
pub type SlotId = usize;

/// One reusable inference request and its batch
#[derive(Debug)]
pub struct Slot<Rq> {
    id: SlotId,
    request: Rq,
    units: Vec<InferenceUnit>,
}

impl<Rq> Slot<Rq> {
    /// Wrap a request, reserving room for `batch_size` units
    pub fn new(id: SlotId, request: Rq, batch_size: usize) -> Self {
        Self {
            id,
            request,
            units: Vec::with_capacity(batch_size),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Number of units batched into this slot
    pub fn inference_count(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn request_mut(&mut self) -> &mut Rq {
        &mut self.request
    }

    /// Borrow the request and the batch separately while filling
    pub(crate) fn parts_mut(&mut self) -> (&mut Rq, &mut Vec<InferenceUnit>) {
        (&mut self.request, &mut self.units)
    }

    #[cfg(test)]
    pub(crate) fn push_unit(&mut self, unit: InferenceUnit) {
        self.units.push(unit);
    }

    pub(crate) fn take_units(&mut self) -> Vec<InferenceUnit> {
        std::mem::take(&mut self.units)
    }

    /// Split into id, request and batched units for an asynchronous dispatch
    pub(crate) fn into_parts(self) -> (SlotId, Rq, Vec<InferenceUnit>) {
        (self.id, self.request, self.units)
    }

    /// Reassemble a slot handed back by the runtime
    pub(crate) fn from_parts(id: SlotId, request: Rq, units: Vec<InferenceUnit>) -> Self {
        Self { id, request, units }
    }
}

/// Bounded FIFO of free slots
pub struct SlotPool<Rq> {
    free: ArrayQueue<Slot<Rq>>,
    capacity: usize,
}

impl<Rq> SlotPool<Rq> {
    /// Build a pool holding every slot in `slots`
    pub fn new(slots: Vec<Slot<Rq>>) -> Self {
        let capacity = slots.len();
        let free = ArrayQueue::new(capacity.max(1));
        for slot in slots {
            // Capacity equals the slot count, so this cannot overflow
            let _ = free.push(slot);
        }
        Self { free, capacity }
    }

    /// Take a free slot; `None` when every slot is in flight
    pub fn acquire(&self) -> Option<Slot<Rq>> {
        let slot = self.free.pop()?;
        METRICS.scheduler.slots_in_flight.inc();
        trace!("Acquired slot {}, {} free", slot.id, self.free.len());
        Some(slot)
    }

    /// Return a slot to the pool, discarding any units it still holds
    pub fn release(&self, mut slot: Slot<Rq>) {
        slot.units.clear();
        let id = slot.id;
        if self.free.push(slot).is_err() {
            error!("Slot {} released into a full pool, dropping it", id);
            return;
        }
        METRICS.scheduler.slots_in_flight.dec();
        trace!("Released slot {}, {} free", id, self.free.len());
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently owned by a dispatch
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Remove every free slot
    pub fn drain(&self) -> Vec<Slot<Rq>> {
        let mut slots = Vec::with_capacity(self.free.len());
        while let Some(slot) = self.free.pop() {
            slots.push(slot);
        }
        slots
    }
}
