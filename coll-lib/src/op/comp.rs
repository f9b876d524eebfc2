//! Receive-completion strategies: what to do with an incoming message and how
//! to decide that the step is over.

use tracing::{error, trace};

use crate::{
    api::{INCAST_ALIGNMENT, IncastAlign},
    error::{CollLibError, Result},
    op::{
        exec::{ExecStatus, SlotCtx, last_step_done, step_done, step_execute},
        step::{FragState, StepFlags},
    },
    topo::PlanMethod,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecvStrategy {
    RecvOne,
    RecvOneThenSend,
    BarrierRecvOneThenSend,
    RecvMany,
    RecvManyThenSendPipe,
    Recv1ManyThenSendZcopy,
    Recv1ManyThenSendNonZcopy,
    ReduceOne,
    ReduceOneThenSend,
    ReduceMany(IncastAlign),
    ReduceManyThenSendPipe(IncastAlign),
    ReduceManyThenSendZcopy(IncastAlign),
    ReduceManyThenSendNonZcopy(IncastAlign),
    WaitOne,
    WaitOneThenSend,
    WaitMany,
    WaitManyThenSend,
    BarrierOne,
    BarrierMany(IncastAlign),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataAction {
    Copy,
    Reduce(IncastAlign),
    Wait(IncastAlign),
}

/// Pending-counter value at which a receive-then-send waypoint forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendThreshold {
    /// Everything arrived.
    Zero,
    /// Only the zero-copy completions of the forwarded fragments remain.
    Fragments,
    /// Only the zero-copy completions of the fan-out remain.
    FanoutFragments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    /// The single expected message arrived.
    StepDone,
    /// Count the arrival, finish the step at zero.
    StepCheck,
    /// Forward right away.
    Execute,
    /// Count the arrival, forward when the threshold is reached.
    SendAt(SendThreshold),
    /// Count the arrival per fragment, forward each fragment once complete.
    Pipeline,
    BarrierDone,
    BarrierCheck,
    BarrierExecute,
}

impl RecvStrategy {
    fn data_action(&self) -> DataAction {
        use RecvStrategy as S;
        match *self {
            S::RecvOne
            | S::RecvOneThenSend
            | S::RecvMany
            | S::RecvManyThenSendPipe
            | S::Recv1ManyThenSendZcopy
            | S::Recv1ManyThenSendNonZcopy => DataAction::Copy,
            S::ReduceOne | S::ReduceOneThenSend => DataAction::Reduce(IncastAlign::None),
            S::ReduceMany(align)
            | S::ReduceManyThenSendPipe(align)
            | S::ReduceManyThenSendZcopy(align)
            | S::ReduceManyThenSendNonZcopy(align) => DataAction::Reduce(align),
            S::BarrierMany(align) => DataAction::Wait(align),
            S::WaitOne
            | S::WaitOneThenSend
            | S::WaitMany
            | S::WaitManyThenSend
            | S::BarrierOne
            | S::BarrierRecvOneThenSend => DataAction::Wait(IncastAlign::None),
        }
    }

    fn completion(&self) -> Completion {
        use RecvStrategy as S;
        match self {
            S::RecvOne | S::ReduceOne | S::WaitOne => Completion::StepDone,
            S::RecvMany | S::ReduceMany(_) | S::WaitMany => Completion::StepCheck,
            S::RecvOneThenSend | S::ReduceOneThenSend | S::WaitOneThenSend => {
                Completion::Execute
            }
            S::RecvManyThenSendPipe | S::ReduceManyThenSendPipe(_) => Completion::Pipeline,
            S::Recv1ManyThenSendZcopy => Completion::SendAt(SendThreshold::FanoutFragments),
            S::ReduceManyThenSendZcopy(_) => Completion::SendAt(SendThreshold::Fragments),
            S::Recv1ManyThenSendNonZcopy
            | S::ReduceManyThenSendNonZcopy(_)
            | S::WaitManyThenSend => Completion::SendAt(SendThreshold::Zero),
            S::BarrierOne => Completion::BarrierDone,
            S::BarrierMany(_) => Completion::BarrierCheck,
            S::BarrierRecvOneThenSend => Completion::BarrierExecute,
        }
    }
}

/// Traits of a step that decide its completion strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorInput {
    pub method: PlanMethod,
    pub fragmented: bool,
    pub pipelined: bool,
    pub single_msg: bool,
    pub ep_cnt: usize,
    pub last_step: bool,
    pub nonzero_length: bool,
    pub zcopy: bool,
    pub barrier: bool,
    pub incast: IncastAlign,
}

pub fn select_recv_strategy(input: &SelectorInput) -> RecvStrategy {
    use RecvStrategy as S;
    let SelectorInput {
        method,
        fragmented,
        pipelined,
        single_msg,
        ep_cnt,
        last_step,
        nonzero_length,
        zcopy,
        barrier,
        incast,
    } = *input;
    let single = single_msg && !zcopy;
    let release = barrier && last_step;

    match method {
        PlanMethod::BcastWaypoint => {
            if pipelined {
                S::RecvManyThenSendPipe
            } else if !nonzero_length {
                if release { S::BarrierRecvOneThenSend } else { S::WaitOneThenSend }
            } else if zcopy {
                S::Recv1ManyThenSendZcopy
            } else if fragmented {
                S::Recv1ManyThenSendNonZcopy
            } else {
                S::RecvOneThenSend
            }
        }
        PlanMethod::RecvTerminal if release => {
            if single { S::BarrierOne } else { S::BarrierMany(IncastAlign::None) }
        }
        PlanMethod::RecvTerminal
        | PlanMethod::SendTerminal
        | PlanMethod::ScatterTerminal
        | PlanMethod::AlltoallBruck
        | PlanMethod::AllgatherBruck
        | PlanMethod::Pairwise => {
            if single { S::RecvOne } else { S::RecvMany }
        }
        PlanMethod::ReduceWaypoint => {
            let single = !zcopy && (single_msg || (ep_cnt == 2 && !fragmented));
            if single {
                if nonzero_length { S::ReduceOneThenSend } else { S::WaitOneThenSend }
            } else if !nonzero_length {
                S::WaitManyThenSend
            } else if pipelined {
                S::ReduceManyThenSendPipe(incast)
            } else if zcopy {
                S::ReduceManyThenSendZcopy(incast)
            } else {
                S::ReduceManyThenSendNonZcopy(incast)
            }
        }
        PlanMethod::ReduceTerminal => match (nonzero_length, barrier, single) {
            (true, _, true) => S::ReduceOne,
            (true, _, false) => S::ReduceMany(incast),
            (false, true, true) => S::BarrierOne,
            (false, true, false) => S::BarrierMany(incast),
            (false, false, true) => S::WaitOne,
            (false, false, false) => S::WaitMany,
        },
        PlanMethod::ReduceRecursive => match (release, single, nonzero_length) {
            (true, true, _) => S::BarrierOne,
            (true, false, _) => S::BarrierMany(IncastAlign::None),
            (false, true, true) => S::ReduceOne,
            (false, true, false) => S::WaitOne,
            (false, false, true) => S::ReduceMany(IncastAlign::None),
            (false, false, false) => S::WaitMany,
        },
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Applies the data action of `strategy`; returns how many contributions the
/// message carried.
fn apply_data(
    ctx: &mut SlotCtx<'_>,
    strategy: RecvStrategy,
    offset: usize,
    payload: &[u8],
) -> Result<usize> {
    let step_i = ctx.slot.req.step;
    let reducer = ctx.reducer;
    let op = &mut *ctx.op;
    let step = &op.steps[step_i];
    let batch = |align| match align {
        IncastAlign::None => 1,
        IncastAlign::Padded | IncastAlign::Packed => step.batch_cnt,
    };

    match strategy.data_action() {
        DataAction::Copy => {
            let dst = op.buffers.get_mut(step.target);
            let region = dst
                .get_mut(offset..offset + payload.len())
                .ok_or(CollLibError::InvalidParam("message outside the receive buffer"))?;
            region.copy_from_slice(payload);
            Ok(1)
        }
        DataAction::Wait(align) => Ok(batch(align)),
        DataAction::Reduce(align) => {
            let items = batch(align);
            let item_len = match align {
                IncastAlign::None => payload.len(),
                _ => step.fragment_at(offset),
            };
            let stride = match align {
                IncastAlign::Padded => align_up(item_len, INCAST_ALIGNMENT),
                IncastAlign::None | IncastAlign::Packed => item_len,
            };
            let dt = op.params.datatype;
            let count = item_len.checked_div(dt.len).unwrap_or(0);
            let dst = op
                .buffers
                .get_mut(step.target)
                .get_mut(offset..offset + item_len)
                .ok_or(CollLibError::InvalidParam("message outside the receive buffer"))?;
            for i in 0..items {
                let src = payload
                    .get(i * stride..i * stride + item_len)
                    .ok_or(CollLibError::InvalidParam("incast message too short"))?;
                reducer.reduce(op.params.op, src, dst, count, dt.id);
            }
            Ok(items)
        }
    }
}

/// Entry point of an incoming message for the armed step of a slot.
pub(crate) fn on_message(
    ctx: &mut SlotCtx<'_>,
    strategy: RecvStrategy,
    offset: usize,
    payload: &[u8],
) -> ExecStatus {
    trace!(
        coll_id = %ctx.slot.req.coll_id,
        step_idx = ctx.slot.req.step_idx,
        offset,
        len = payload.len(),
        ?strategy,
        "Incoming collective message"
    );
    let arrivals = match apply_data(ctx, strategy, offset, payload) {
        Ok(arrivals) => arrivals,
        Err(e) => {
            error!(coll_id = %ctx.slot.req.coll_id, %e, "Failed to consume message");
            return last_step_done(ctx, Err(e));
        }
    };

    match strategy.completion() {
        Completion::StepDone => step_done(ctx),
        Completion::Execute => step_execute(ctx),
        Completion::StepCheck => {
            if count_arrivals(ctx, arrivals) {
                step_done(ctx)
            } else {
                ExecStatus::InProgress
            }
        }
        Completion::SendAt(threshold) => {
            let step = &ctx.op.steps[ctx.slot.req.step];
            let threshold = match threshold {
                SendThreshold::Zero => 0,
                SendThreshold::Fragments => step.fragments,
                SendThreshold::FanoutFragments => step.ep_cnt.saturating_sub(1) * step.fragments,
            };
            let req = &mut ctx.slot.req;
            let before = req.pending;
            req.pending = req.pending.saturating_sub(arrivals);
            if before > threshold && req.pending <= threshold {
                step_execute(ctx)
            } else {
                ExecStatus::InProgress
            }
        }
        Completion::Pipeline => on_fragment(ctx, offset, arrivals),
        Completion::BarrierDone => {
            *ctx.barrier_released = true;
            step_done(ctx)
        }
        Completion::BarrierCheck => {
            if count_arrivals(ctx, arrivals) {
                *ctx.barrier_released = true;
                step_done(ctx)
            } else {
                ExecStatus::InProgress
            }
        }
        Completion::BarrierExecute => {
            *ctx.barrier_released = true;
            step_execute(ctx)
        }
    }
}

/// Decrements the pending counter; true when it reached zero.
fn count_arrivals(ctx: &mut SlotCtx<'_>, arrivals: usize) -> bool {
    let req = &mut ctx.slot.req;
    req.pending = req.pending.saturating_sub(arrivals);
    req.pending == 0
}

fn on_fragment(ctx: &mut SlotCtx<'_>, offset: usize, arrivals: usize) -> ExecStatus {
    let step_i = ctx.slot.req.step;
    ctx.slot.req.pending = ctx.slot.req.pending.saturating_sub(arrivals);
    if ctx.op.steps[step_i].pipeline.is_none() {
        return last_step_done(ctx, Err(CollLibError::InvalidParam("step is not pipelined")));
    }
    let step = &mut ctx.op.steps[step_i];
    let idx = step.fragment_index(offset);
    let frag_len = step.fragment_length;
    let Some(pipe) = step.pipeline.as_mut() else {
        return ExecStatus::InProgress;
    };
    let Some(FragState::Pending(missing)) = pipe.frags.get_mut(idx) else {
        return ExecStatus::InProgress;
    };
    *missing = missing.saturating_sub(arrivals);
    if *missing > 0 {
        return ExecStatus::InProgress;
    }
    if pipe.blocked {
        pipe.frags[idx] = FragState::Resend;
        return ExecStatus::InProgress;
    }
    step.cursor.offset = idx * frag_len;
    step_execute(ctx)
}

/// Local completion of a zero-copy send of the slot's current step.
pub(crate) fn on_zcopy_completion(ctx: &mut SlotCtx<'_>, status: Result<()>) -> ExecStatus {
    if let Err(e) = status {
        error!(coll_id = %ctx.slot.req.coll_id, %e, "Zero-copy send failed");
        return last_step_done(ctx, Err(e));
    }
    let step = &ctx.op.steps[ctx.slot.req.step];
    let blocked = step.pipeline.as_ref().is_some_and(|p| p.blocked);
    let sending = step.flags.contains(StepFlags::PIPELINED) && blocked;
    if count_arrivals(ctx, 1) && !sending {
        step_done(ctx)
    } else {
        ExecStatus::InProgress
    }
}
