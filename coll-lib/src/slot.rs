use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::{
    api::{CollHeader, CollId, CollRequest, OpId, local_id},
    op::RecvStrategy,
};

/// Number of collectives that may be in flight in one group at a time.
pub const MAX_CONCURRENT_OPS: usize = 8;

const _: () = assert!(MAX_CONCURRENT_OPS.is_power_of_two() && MAX_CONCURRENT_OPS <= 64);

pub fn slot_of(coll_id: CollId) -> usize {
    coll_id.0 as usize % MAX_CONCURRENT_OPS
}

/// A message that arrived before its step armed a handler.
pub(crate) struct HeldMessage {
    pub header: CollHeader,
    pub payload: Bytes,
}

/// The live state of one collective invocation.
#[derive(Default)]
pub(crate) struct Request {
    pub op: Option<OpId>,
    pub coll_id: CollId,
    /// Position of the current step inside the operation.
    pub step: usize,
    /// Wire step index of the current step.
    pub step_idx: u8,
    pub pending: usize,
    pub handle: Option<CollRequest>,
}

impl Request {
    pub fn local_id(&self) -> u16 {
        local_id(self.coll_id, self.step_idx)
    }
}

#[derive(Default)]
pub(crate) struct Slot {
    pub req: Request,
    /// Handler of the armed step, `None` until the step expects messages.
    pub cb: Option<RecvStrategy>,
    pub messages: Vec<HeldMessage>,
}

impl Slot {
    pub fn is_busy(&self) -> bool {
        self.req.op.is_some()
    }

    /// Whether a message with `header` can be handed to the armed handler now.
    pub fn accepts(&self, header: &CollHeader) -> bool {
        self.cb.is_some() && self.is_busy() && self.req.local_id() == header.local_id()
    }

    /// Removes the oldest held message addressed to `local_id`.
    pub fn take_held(&mut self, local_id: u16) -> Option<HeldMessage> {
        let pos = self.messages.iter().position(|m| m.header.local_id() == local_id)?;
        Some(self.messages.remove(pos))
    }
}

/// One bit per slot whose current step is blocked on transport back-pressure.
#[derive(Debug, Default)]
pub struct ResendSlots(AtomicU64);

impl ResendSlots {
    pub fn mark(&self, slot: usize) {
        self.0.fetch_or(1 << slot, Ordering::AcqRel);
    }

    pub fn is_marked(&self, slot: usize) -> bool {
        self.0.load(Ordering::Acquire) & (1 << slot) != 0
    }

    /// Clears the bitmap, returning the slots that were marked.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}
