//! The step execution engine: issues the sends of the current step, arms the
//! receive path and moves the request from step to step.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::{
    api::{CollHeader, CollId, GroupId, ZcopyCompletion},
    error::{CollLibError, Result},
    interface::{Endpoint, Reducer},
    op::{
        Operation,
        comp::on_message,
        step::{Cursor, FragState, SendArgs, Step, StepFlags},
    },
    plan::{Phase, Plan},
    slot::{ResendSlots, Slot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    InProgress,
    /// The request left its slot, successfully or not.
    Completed,
}

/// Everything a step needs while it runs: its operation, its slot and the
/// group-wide state shared between slots.
pub(crate) struct SlotCtx<'a> {
    pub group_id: GroupId,
    pub slot_index: usize,
    pub op: &'a mut Operation,
    pub slot: &'a mut Slot,
    pub resend: &'a ResendSlots,
    pub reducer: &'a dyn Reducer,
    pub barrier_released: &'a mut bool,
}

fn header_at(
    group_id: GroupId,
    coll_id: CollId,
    step_idx: u8,
    remote_offset: usize,
) -> Result<CollHeader> {
    let offset = u32::try_from(remote_offset)
        .map_err(|_| CollLibError::InvalidParam("offset exceeds the header range"))?;
    Ok(CollHeader::new(group_id, coll_id, step_idx, offset))
}

/// Sends `data` to one endpoint, fragment by fragment, starting at the step's
/// cursor offset. On failure the cursor stays on the failed fragment.
fn send_fragments(
    step: &mut Step,
    group_id: GroupId,
    coll_id: CollId,
    ep: &dyn Endpoint,
    data: &[u8],
    remote_offset: usize,
) -> Result<()> {
    let len = data.len();
    let frag = if step.flags.contains(StepFlags::FRAGMENTED) {
        step.fragment_length
    } else {
        len
    };
    let comp = ZcopyCompletion { group_id, coll_id };
    loop {
        let off = step.cursor.offset;
        let n = frag.min(len - off);
        let args = SendArgs {
            ep,
            header: header_at(group_id, coll_id, step.step_idx, remote_offset + off)?,
            payload: &data[off..off + n],
            memh: step.memh,
            comp,
        };
        (step.send_fn)(&args)?;
        step.cursor.offset = off + n;
        if step.cursor.offset >= len {
            break;
        }
    }
    step.cursor.offset = 0;
    Ok(())
}

/// Issues every remaining send of a non-pipelined step.
fn send_all(ctx: &mut SlotCtx<'_>, phase: &Phase) -> Result<()> {
    let group_id = ctx.group_id;
    let coll_id = ctx.slot.req.coll_id;
    let Operation { steps, buffers, .. } = &mut *ctx.op;
    let step = &mut steps[ctx.slot.req.step];
    if !step.sends() {
        return Ok(());
    }
    let src = buffers.get(step.source);

    while step.cursor.ep < step.ep_cnt {
        let ep = step.cursor.ep;
        while step.cursor.item < step.items {
            let (src_off, remote_off) = step.locate(ep, step.cursor.item);
            let data = src
                .get(src_off..src_off + step.buffer_length)
                .ok_or(CollLibError::InvalidParam("send outside the source buffer"))?;
            send_fragments(step, group_id, coll_id, phase.eps[ep].as_ref(), data, remote_off)?;
            step.cursor.item += 1;
        }
        step.cursor.item = 0;
        step.cursor.ep += 1;
    }
    step.cursor = Cursor::default();
    Ok(())
}

/// Forwards one complete fragment of a pipelined waypoint, or the next fragment
/// waiting for a resend.
fn send_pipelined(ctx: &mut SlotCtx<'_>, phase: &Phase) -> Result<()> {
    let group_id = ctx.group_id;
    let coll_id = ctx.slot.req.coll_id;
    let Operation { steps, buffers, .. } = &mut *ctx.op;
    let step = &mut steps[ctx.slot.req.step];
    let start = step.receive_start();
    let frag_len = step.fragment_length;
    let Some(pipe) = step.pipeline.as_mut() else {
        return Err(CollLibError::InvalidParam("step is not pipelined"));
    };

    let idx = if !pipe.blocked {
        step.cursor.offset.checked_div(frag_len).unwrap_or(0)
    } else if let Some(idx) = pipe.inflight.take() {
        idx
    } else if let Some(idx) = pipe.first_resend() {
        step.cursor.ep = start;
        idx
    } else {
        pipe.blocked = false;
        return Ok(());
    };

    let off = idx * frag_len;
    step.cursor.offset = off;
    let n = frag_len.min(step.buffer_length.saturating_sub(off));
    let payload = buffers
        .get(step.source)
        .get(off..off + n)
        .ok_or(CollLibError::InvalidParam("fragment outside the source buffer"))?;
    let header = header_at(group_id, coll_id, step.step_idx, step.remote_base + off)?;
    let comp = ZcopyCompletion { group_id, coll_id };

    while step.cursor.ep < step.ep_cnt {
        let args = SendArgs {
            ep: phase.eps[step.cursor.ep].as_ref(),
            header,
            payload,
            memh: step.memh,
            comp,
        };
        if let Err(e) = (step.send_fn)(&args) {
            if e.is_no_resource() {
                pipe.frags[idx] = FragState::Resend;
                pipe.inflight = Some(idx);
                pipe.blocked = true;
            }
            return Err(e);
        }
        step.cursor.ep += 1;
    }
    step.cursor.ep = start;

    if pipe.frags[idx] == FragState::Resend {
        pipe.frags[idx] = FragState::Pending(0);
    }
    if pipe.blocked {
        if pipe.first_resend().is_some() {
            return Err(CollLibError::NoResource);
        }
        pipe.blocked = false;
    }
    Ok(())
}

/// Drives the current step of the slot's request as far as it can go.
pub(crate) fn step_execute(ctx: &mut SlotCtx<'_>) -> ExecStatus {
    let step_i = ctx.slot.req.step;
    let plan: Arc<Plan> = Arc::clone(&ctx.op.plan);
    let step = &mut ctx.op.steps[step_i];
    let flags = step.flags;

    if flags.intersects(StepFlags::RECV_BEFORE_SEND) && step.cursor.ep == 0 {
        let start = step.receive_start();
        step.cursor.ep = start;
        if let Some(pipe) = step.pipeline.as_mut() {
            pipe.reset(start);
        }
        if !step.is_zcopy() {
            ctx.slot.req.pending = start * step.fragments;
        }
        return arm(ctx);
    }

    let phase = &plan.phases[step.phase];
    let sent = if flags.contains(StepFlags::PIPELINED) {
        send_pipelined(ctx, phase)
    } else {
        send_all(ctx, phase)
    };
    match sent {
        Ok(()) => {}
        Err(CollLibError::NoResource) => {
            trace!(
                coll_id = %ctx.slot.req.coll_id,
                step_idx = ctx.slot.req.step_idx,
                "Send blocked, scheduling resend"
            );
            ctx.resend.mark(ctx.slot_index);
            return ExecStatus::InProgress;
        }
        Err(e) => {
            error!(
                coll_id = %ctx.slot.req.coll_id,
                step_idx = ctx.slot.req.step_idx,
                %e,
                "Collective send failed"
            );
            return last_step_done(ctx, Err(e));
        }
    }

    let step = &ctx.op.steps[step_i];
    let pending = ctx.slot.req.pending;
    let done = match &step.pipeline {
        Some(pipe) => pending == 0 && !pipe.blocked,
        None => {
            (!flags.contains(StepFlags::RECV_AFTER_SEND) && !step.is_zcopy()) || pending == 0
        }
    };
    if done { step_done(ctx) } else { arm(ctx) }
}

/// Installs the step's handler and hands it every message held for the step.
fn arm(ctx: &mut SlotCtx<'_>) -> ExecStatus {
    ctx.slot.cb = Some(ctx.op.steps[ctx.slot.req.step].recv_cb);
    replay_held(ctx)
}

fn replay_held(ctx: &mut SlotCtx<'_>) -> ExecStatus {
    loop {
        if !ctx.slot.is_busy() {
            return ExecStatus::Completed;
        }
        let Some(cb) = ctx.slot.cb else {
            return ExecStatus::InProgress;
        };
        let Some(msg) = ctx.slot.take_held(ctx.slot.req.local_id()) else {
            return ExecStatus::InProgress;
        };
        trace!(header = %msg.header, "Replaying held message");
        on_message(ctx, cb, msg.header.remote_offset() as usize, &msg.payload);
    }
}

/// The current step is fully acknowledged: finish the request or start the
/// next step.
pub(crate) fn step_done(ctx: &mut SlotCtx<'_>) -> ExecStatus {
    let step_i = ctx.slot.req.step;
    if ctx.op.steps[step_i].flags.contains(StepFlags::LAST_STEP) {
        return last_step_done(ctx, Ok(()));
    }
    let next = &ctx.op.steps[step_i + 1];
    ctx.slot.cb = None;
    let req = &mut ctx.slot.req;
    req.step = step_i + 1;
    req.step_idx = next.step_idx;
    req.pending = next.initial_pending();
    trace!(coll_id = %req.coll_id, step_idx = req.step_idx, "Advancing to next step");
    step_execute(ctx)
}

/// Retires the request with `status`, running the fini stage on success.
pub(crate) fn last_step_done(ctx: &mut SlotCtx<'_>, status: Result<()>) -> ExecStatus {
    let status = status.and_then(|()| ctx.op.run_fini());
    ctx.op.reset_steps();
    ctx.op.active = false;
    ctx.slot.cb = None;
    let req = std::mem::take(&mut ctx.slot.req);
    debug!(coll_id = %req.coll_id, ok = status.is_ok(), "Collective completed");
    if let Some(handle) = req.handle {
        handle.complete(status);
    }
    ExecStatus::Completed
}
