use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    api::{
        CollHeader, CollId, CollRequest, CollectiveModifiers, CollectiveParams, CollectiveType,
        GroupId, HostId, MemberIndex, OpId,
    },
    config::BuiltinConfig,
    error::{CollLibError, Result},
    interface::{Reducer, Transport},
    op::{
        ExecStatus, Operation,
        exec::{SlotCtx, last_step_done, step_execute},
        on_message, on_zcopy_completion,
    },
    plan::Plan,
    slot::{HeldMessage, MAX_CONCURRENT_OPS, Request, ResendSlots, Slot, slot_of},
    topo::mixes_locality,
};

/// Counters of the plan/operation caches and of the request life cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    pub plans_created: u64,
    pub plans_reused: u64,
    pub ops_created: u64,
    pub ops_reused: u64,
    pub ops_started: u64,
    pub ops_completed_immediately: u64,
    pub ops_queued: u64,
    pub ops_evicted: u64,
    pub messages_held: u64,
    pub resends: u64,
}

struct PlanEntry {
    plan: Arc<Plan>,
    /// Cached operations built from the plan, oldest first.
    ops: VecDeque<OpId>,
}

/// Everything needed to join a group.
pub struct GroupParams {
    pub group_id: GroupId,
    pub member_count: usize,
    pub my_index: MemberIndex,
    /// Host of every member, by member index. Empty when unknown.
    pub member_hosts: Vec<HostId>,
    pub transport: Arc<dyn Transport>,
}

/// Per-group state: concurrency slots, resend bitmap, plan and operation caches.
pub struct Group {
    group_id: GroupId,
    group_size: usize,
    my_index: MemberIndex,
    /// Some host runs several members while others run elsewhere.
    mixed_locality: bool,
    config: Arc<BuiltinConfig>,
    transport: Arc<dyn Transport>,
    reducer: Arc<dyn Reducer>,
    slots: [Slot; MAX_CONCURRENT_OPS],
    resend: ResendSlots,
    plans: Vec<PlanEntry>,
    ops: HashMap<OpId, Operation>,
    next_op_id: u64,
    last_coll_id: CollId,
    /// The barrier in flight, if any. Collectives started meanwhile wait in `queued`.
    barrier: Option<CollRequest>,
    barrier_released: bool,
    queued: VecDeque<(OpId, CollId, CollRequest)>,
    stats: GroupStats,
}

impl Group {
    pub(crate) fn new(
        params: GroupParams,
        config: Arc<BuiltinConfig>,
        reducer: Arc<dyn Reducer>,
    ) -> Result<Self> {
        if params.member_count == 0 || params.my_index >= params.member_count {
            return Err(CollLibError::Config(format!(
                "member {} outside group of {}",
                params.my_index, params.member_count
            )));
        }
        if !params.member_hosts.is_empty() && params.member_hosts.len() != params.member_count {
            return Err(CollLibError::Config(format!(
                "{} member hosts given for a group of {}",
                params.member_hosts.len(),
                params.member_count
            )));
        }
        let mixed_locality = mixes_locality(&params.member_hosts);
        debug!(
            group_id = %params.group_id,
            member_count = params.member_count,
            my_index = params.my_index,
            mixed_locality,
            "Created collective group"
        );
        Ok(Self {
            group_id: params.group_id,
            group_size: params.member_count,
            my_index: params.my_index,
            mixed_locality,
            config,
            transport: params.transport,
            reducer,
            slots: std::array::from_fn(|_| Slot::default()),
            resend: ResendSlots::default(),
            plans: Vec::new(),
            ops: HashMap::new(),
            next_op_id: 0,
            last_coll_id: CollId(0),
            barrier: None,
            barrier_released: false,
            queued: VecDeque::new(),
            stats: GroupStats::default(),
        })
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn my_index(&self) -> MemberIndex {
        self.my_index
    }

    pub fn stats(&self) -> &GroupStats {
        &self.stats
    }

    pub fn plan(&self, coll_type: &CollectiveType) -> Option<Arc<Plan>> {
        self.plans
            .iter()
            .find(|entry| entry.plan.coll_type == *coll_type)
            .map(|entry| Arc::clone(&entry.plan))
    }

    pub fn operation(&self, op_id: OpId) -> Result<&Operation> {
        self.ops.get(&op_id).ok_or(CollLibError::InvalidParam("unknown operation"))
    }

    pub fn send_buffer_mut(&mut self, op_id: OpId) -> Result<&mut [u8]> {
        let op = self
            .ops
            .get_mut(&op_id)
            .ok_or(CollLibError::InvalidParam("unknown operation"))?;
        Ok(op.send_buffer_mut())
    }

    pub fn recv_buffer_mut(&mut self, op_id: OpId) -> Result<&mut [u8]> {
        let op = self
            .ops
            .get_mut(&op_id)
            .ok_or(CollLibError::InvalidParam("unknown operation"))?;
        Ok(op.recv_buffer_mut())
    }

    pub fn recv_buffer(&self, op_id: OpId) -> Result<&[u8]> {
        Ok(self.operation(op_id)?.recv_buffer())
    }

    fn is_idle(&self, op_id: OpId) -> bool {
        self.ops.get(&op_id).is_some_and(|op| !op.is_active())
            && !self.queued.iter().any(|(id, ..)| *id == op_id)
    }

    /// Returns an idle cached operation with the same parameters, or builds a
    /// new one (and its plan, on first use of the collective type).
    pub fn collective_create(&mut self, params: CollectiveParams) -> Result<OpId> {
        let entry_idx = match self
            .plans
            .iter()
            .position(|entry| entry.plan.coll_type == params.coll_type)
        {
            Some(idx) => {
                self.stats.plans_reused += 1;
                idx
            }
            None => {
                let plan = Plan::build(
                    self.group_id,
                    self.group_size,
                    self.my_index,
                    self.mixed_locality,
                    params.coll_type,
                    &self.config,
                    self.transport.as_ref(),
                )?;
                self.plans.push(PlanEntry { plan, ops: VecDeque::new() });
                self.stats.plans_created += 1;
                self.plans.len() - 1
            }
        };

        let cached = self.plans[entry_idx].ops.iter().copied().find(|&op_id| {
            self.is_idle(op_id) && self.ops.get(&op_id).is_some_and(|op| *op.params() == params)
        });
        if let Some(op_id) = cached {
            self.stats.ops_reused += 1;
            return Ok(op_id);
        }

        let op_id = OpId(self.next_op_id);
        self.next_op_id += 1;
        let op = Operation::create(
            op_id,
            params,
            Arc::clone(&self.plans[entry_idx].plan),
            &self.config,
            Arc::clone(&self.transport),
        )?;
        self.ops.insert(op_id, op);
        self.plans[entry_idx].ops.push_back(op_id);
        self.stats.ops_created += 1;
        self.evict(entry_idx, op_id);
        Ok(op_id)
    }

    /// Drops the oldest idle operations of a plan beyond the cache size,
    /// never `keep`.
    fn evict(&mut self, entry_idx: usize, keep: OpId) {
        while self.plans[entry_idx].ops.len() > self.config.cache_size {
            let Some(pos) = self.plans[entry_idx]
                .ops
                .iter()
                .position(|&id| id != keep && self.is_idle(id))
            else {
                return;
            };
            let Some(op_id) = self.plans[entry_idx].ops.remove(pos) else {
                return;
            };
            if let Some(mut op) = self.ops.remove(&op_id) {
                debug!(group_id = %self.group_id, op_id = op_id.0, "Evicting cached operation");
                op.discard();
                self.stats.ops_evicted += 1;
            }
        }
    }

    /// Removes an operation from the cache and releases its registered memory.
    pub fn discard_op(&mut self, op_id: OpId) -> Result<()> {
        if !self.is_idle(op_id) {
            return Err(CollLibError::InvalidParam("operation unknown or in flight"));
        }
        for entry in &mut self.plans {
            entry.ops.retain(|&id| id != op_id);
        }
        if let Some(mut op) = self.ops.remove(&op_id) {
            op.discard();
        }
        Ok(())
    }

    /// Starts a collective with the next collective id. The returned request
    /// completes once every step of the operation did.
    pub fn collective_start(&mut self, op_id: OpId) -> Result<CollRequest> {
        if !self.is_idle(op_id) {
            return Err(CollLibError::InvalidParam("operation unknown or in flight"));
        }
        let coll_id = self.last_coll_id.next();
        self.last_coll_id = coll_id;
        let handle = CollRequest::new(coll_id);
        self.stats.ops_started += 1;

        if self.barrier.is_some() {
            debug!(
                group_id = %self.group_id,
                %coll_id,
                "Queueing collective behind outstanding barrier"
            );
            self.queued.push_back((op_id, coll_id, handle.clone()));
            self.stats.ops_queued += 1;
            return Ok(handle);
        }

        self.trigger(op_id, coll_id, handle.clone())?;
        self.drain_barrier_queue();
        Ok(handle)
    }

    fn trigger(&mut self, op_id: OpId, coll_id: CollId, handle: CollRequest) -> Result<()> {
        let slot_index = slot_of(coll_id);
        if self.slots[slot_index].is_busy() {
            error!(
                group_id = %self.group_id,
                %coll_id,
                busy_with = %self.slots[slot_index].req.coll_id,
                "Exceeded the max concurrent collectives"
            );
            return Err(CollLibError::SlotBusy { coll_id });
        }
        let op = self
            .ops
            .get_mut(&op_id)
            .ok_or(CollLibError::InvalidParam("unknown operation"))?;
        if op.is_active() {
            return Err(CollLibError::InvalidParam("operation already in flight"));
        }

        op.tick_optimization();
        op.run_init()?;
        if op.params().coll_type.modifiers().contains(CollectiveModifiers::BARRIER) {
            self.barrier = Some(handle.clone());
        }
        let (step_idx, pending) = op
            .steps()
            .first()
            .map_or((0, 0), |step| (step.step_idx, step.initial_pending()));
        let empty = op.steps().is_empty();
        op.active = true;
        self.slots[slot_index].req = Request {
            op: Some(op_id),
            coll_id,
            step: 0,
            step_idx,
            pending,
            handle: Some(handle),
        };
        debug!(group_id = %self.group_id, %coll_id, op_id = op_id.0, "Triggered collective");

        let status = if empty {
            self.with_slot(slot_index, |ctx| last_step_done(ctx, Ok(())))
        } else {
            self.with_slot(slot_index, step_execute)
        };
        if status == Some(ExecStatus::Completed) {
            self.stats.ops_completed_immediately += 1;
        }
        Ok(())
    }

    /// Runs `f` over the request in `slot_index`, if the slot is busy.
    fn with_slot<R>(
        &mut self,
        slot_index: usize,
        f: impl FnOnce(&mut SlotCtx<'_>) -> R,
    ) -> Option<R> {
        let slot = &mut self.slots[slot_index];
        let op_id = slot.req.op?;
        let op = self.ops.get_mut(&op_id)?;
        let mut ctx = SlotCtx {
            group_id: self.group_id,
            slot_index,
            op,
            slot,
            resend: &self.resend,
            reducer: self.reducer.as_ref(),
            barrier_released: &mut self.barrier_released,
        };
        Some(f(&mut ctx))
    }

    /// Once the outstanding barrier is released, triggers the queued
    /// collectives in start order, up to the next barrier.
    fn drain_barrier_queue(&mut self) {
        loop {
            if let Some(barrier) = &self.barrier {
                if !self.barrier_released && !barrier.is_completed() {
                    return;
                }
                debug!(group_id = %self.group_id, coll_id = %barrier.coll_id(), "Barrier released");
            }
            self.barrier = None;
            self.barrier_released = false;
            let Some((op_id, coll_id, handle)) = self.queued.pop_front() else {
                return;
            };
            if let Err(e) = self.trigger(op_id, coll_id, handle.clone()) {
                error!(group_id = %self.group_id, %coll_id, %e, "Failed to start queued collective");
                handle.complete(Err(e));
            }
        }
    }

    /// Delivers one incoming message, or holds it until its step is armed.
    pub fn handle_message(&mut self, header: CollHeader, payload: Bytes) {
        let slot_index = slot_of(header.coll_id());
        let slot = &mut self.slots[slot_index];
        let cb = match slot.cb {
            Some(cb) if slot.accepts(&header) => cb,
            _ => {
                debug!(group_id = %self.group_id, %header, "Holding early collective message");
                slot.messages.push(HeldMessage { header, payload });
                self.stats.messages_held += 1;
                return;
            }
        };
        let offset = header.remote_offset() as usize;
        self.with_slot(slot_index, |ctx| on_message(ctx, cb, offset, &payload));
        self.drain_barrier_queue();
    }

    /// Local completion of a zero-copy send issued by collective `coll_id`.
    pub fn zcopy_completed(&mut self, coll_id: CollId, status: Result<()>) {
        let slot_index = slot_of(coll_id);
        let slot = &self.slots[slot_index];
        if !slot.is_busy() || slot.req.coll_id != coll_id {
            warn!(group_id = %self.group_id, %coll_id, "Dropping stale zero-copy completion");
            return;
        }
        self.with_slot(slot_index, |ctx| on_zcopy_completion(ctx, status));
        self.drain_barrier_queue();
    }

    /// Retries every send blocked on back-pressure. Returns the number of
    /// slots that got past their blocked send.
    pub fn progress(&mut self) -> usize {
        let marked = self.resend.take();
        let mut advanced = 0;
        for slot_index in 0..MAX_CONCURRENT_OPS {
            if marked & (1 << slot_index) == 0 {
                continue;
            }
            self.stats.resends += 1;
            let retried = self.with_slot(slot_index, step_execute);
            if retried.is_some() && !self.resend.is_marked(slot_index) {
                advanced += 1;
            }
        }
        self.drain_barrier_queue();
        advanced
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_busy() {
                warn!(
                    group_id = %self.group_id,
                    slot = index,
                    coll_id = %slot.req.coll_id,
                    step_idx = slot.req.step_idx,
                    "Destroying group with an incomplete collective"
                );
            }
            for msg in &slot.messages {
                warn!(
                    group_id = %self.group_id,
                    slot = index,
                    header = %msg.header,
                    "Destroying group with a held message"
                );
            }
        }
        for op in self.ops.values_mut() {
            op.discard();
        }
    }
}
