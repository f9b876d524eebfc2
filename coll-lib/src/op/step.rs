use bitflags::bitflags;

use crate::{
    api::{
        CollHeader, CollectiveKind, CollectiveModifiers, CollectiveParams, IncastAlign,
        MemHandle, MemberIndex, SmallVec, ZcopyCompletion,
    },
    config::BuiltinConfig,
    error::{CollLibError, Result},
    interface::Endpoint,
    op::comp::{RecvStrategy, SelectorInput, select_recv_strategy},
    plan::{Phase, Plan, Thresholds},
    topo::PlanMethod,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StepFlags: u16 {
        const SEND_AM_SHORT = 1 << 0;
        const SEND_AM_BCOPY = 1 << 1;
        const SEND_AM_ZCOPY = 1 << 2;
        const FRAGMENTED = 1 << 3;
        const PIPELINED = 1 << 4;
        const SINGLE_ENDPOINT = 1 << 5;
        const FIRST_STEP = 1 << 6;
        const LAST_STEP = 1 << 7;
        /// Send first, then expect messages from the same peers.
        const RECV_AFTER_SEND = 1 << 8;
        /// Expect messages from every peer but the last, then send to the last.
        const RECV_BEFORE_SEND1 = 1 << 9;
        /// Expect a message from the first peer, then send to every other.
        const RECV1_BEFORE_SEND = 1 << 10;
        const SEND_FROM_RECV_BUF = 1 << 11;
        /// Every send computes its own source block.
        const CALC_SENT_BUFFERS = 1 << 12;

        const SEND_MODE =
            Self::SEND_AM_SHORT.bits() | Self::SEND_AM_BCOPY.bits() | Self::SEND_AM_ZCOPY.bits();
        const RECV_BEFORE_SEND =
            Self::RECV_BEFORE_SEND1.bits() | Self::RECV1_BEFORE_SEND.bits();
    }
}

/// Which of the operation's buffers a step reads from or writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Send,
    Recv,
    Scratch,
}

/// Per-send source selection for steps that do not send one contiguous region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SendCalc {
    /// Endpoint `i` receives the block indexed by its member index.
    PeerBlock(SmallVec<MemberIndex>),
    /// The single endpoint receives every listed block, at the same index.
    BruckBlocks(Vec<usize>),
}

/// Resume point of a step: endpoint, calc item and byte offset inside the item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub ep: usize,
    pub item: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FragState {
    /// Arrivals still missing before the fragment can be forwarded.
    Pending(usize),
    /// Complete, but its forwarding is blocked on back-pressure.
    Resend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pipeline {
    pub frags: Vec<FragState>,
    pub blocked: bool,
    /// Fragment whose forwarding was interrupted, resumed before any other.
    pub inflight: Option<usize>,
}

impl Pipeline {
    fn new(fragments: usize) -> Self {
        Self { frags: vec![FragState::Pending(0); fragments], blocked: false, inflight: None }
    }

    pub fn reset(&mut self, expected: usize) {
        self.frags.fill(FragState::Pending(expected));
        self.blocked = false;
        self.inflight = None;
    }

    pub fn first_resend(&self) -> Option<usize> {
        self.frags.iter().position(|f| *f == FragState::Resend)
    }
}

/// Arguments of one transport send.
pub(crate) struct SendArgs<'a> {
    pub ep: &'a dyn Endpoint,
    pub header: CollHeader,
    pub payload: &'a [u8],
    pub memh: Option<MemHandle>,
    pub comp: ZcopyCompletion,
}

pub(crate) type SendFn = fn(&SendArgs<'_>) -> Result<()>;

fn send_dummy(_args: &SendArgs<'_>) -> Result<()> {
    Ok(())
}

fn send_am_short(args: &SendArgs<'_>) -> Result<()> {
    args.ep.am_short(args.header, args.payload)
}

fn send_am_bcopy(args: &SendArgs<'_>) -> Result<()> {
    args.ep.am_bcopy(args.header, args.payload).map(|_| ())
}

fn send_am_zcopy(args: &SendArgs<'_>) -> Result<()> {
    let memh = args.memh.ok_or(CollLibError::InvalidParam("zero-copy send without memory handle"))?;
    args.ep.am_zcopy(args.header, args.payload, memh, args.comp)
}

pub(crate) fn send_fn_for(flags: StepFlags) -> SendFn {
    if flags.contains(StepFlags::SEND_AM_ZCOPY) {
        send_am_zcopy
    } else if flags.contains(StepFlags::SEND_AM_BCOPY) {
        send_am_bcopy
    } else if flags.contains(StepFlags::SEND_AM_SHORT) {
        send_am_short
    } else {
        send_dummy
    }
}

/// Send mode and fragmentation of a message of a given length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSizing {
    pub flags: StepFlags,
    pub fragment_length: usize,
    pub fragments: usize,
}

fn fragment_limit(limit: usize, dt_len: usize) -> Result<usize> {
    let length = if dt_len == 0 { limit } else { limit - limit % dt_len };
    if length == 0 {
        return Err(CollLibError::Unsupported("datatype larger than the fragment limit"));
    }
    Ok(length)
}

fn fragmented(mode: StepFlags, length: usize, limit: usize, dt_len: usize) -> Result<SendSizing> {
    let fragment_length = fragment_limit(limit, dt_len)?;
    Ok(SendSizing {
        flags: mode | StepFlags::FRAGMENTED,
        fragment_length,
        fragments: length.div_ceil(fragment_length),
    })
}

/// Picks the send mode for `length` bytes of `dt_len`-byte elements.
pub fn step_send_flags(
    length: usize,
    dt_len: usize,
    thresholds: &Thresholds,
    max_reg: usize,
    allow_zcopy: bool,
) -> Result<SendSizing> {
    let single = |flags| Ok(SendSizing { flags, fragment_length: length, fragments: 1 });
    let t = thresholds;
    if length > 0 && dt_len == 0 {
        return Err(CollLibError::InvalidParam("zero-sized datatype"));
    }

    let short = t.short_supported() && t.max_short_one > 0;
    if short && length <= t.max_short_one {
        single(StepFlags::SEND_AM_SHORT)
    } else if short && length <= t.max_short_max {
        fragmented(StepFlags::SEND_AM_SHORT, length, t.max_short_one, dt_len)
    } else if allow_zcopy && length > t.max_bcopy_max && length <= max_reg {
        if length < t.max_zcopy_one {
            single(StepFlags::SEND_AM_ZCOPY)
        } else {
            fragmented(StepFlags::SEND_AM_ZCOPY, length, t.max_zcopy_one, dt_len)
        }
    } else if length <= t.max_bcopy_one {
        single(StepFlags::SEND_AM_BCOPY)
    } else {
        fragmented(StepFlags::SEND_AM_BCOPY, length, t.max_bcopy_one, dt_len)
    }
}

/// The mutable per-phase execution record of an operation.
pub struct Step {
    pub(crate) phase: usize,
    pub(crate) method: PlanMethod,
    pub(crate) step_idx: u8,
    pub(crate) flags: StepFlags,
    pub(crate) ep_cnt: usize,
    pub(crate) source: BufferKind,
    pub(crate) target: BufferKind,
    /// Bytes of one send item.
    pub(crate) buffer_length: usize,
    /// Offset of this step's data in the receivers' buffers.
    pub(crate) remote_base: usize,
    pub(crate) fragment_length: usize,
    pub(crate) fragments: usize,
    /// Send items per endpoint.
    pub(crate) items: usize,
    pub(crate) calc: Option<SendCalc>,
    pub(crate) incast: IncastAlign,
    pub(crate) batch_cnt: usize,
    pub(crate) barrier: bool,
    pub(crate) send_fn: SendFn,
    pub(crate) recv_cb: RecvStrategy,
    pub(crate) memh: Option<MemHandle>,
    pub(crate) cursor: Cursor,
    pub(crate) pipeline: Option<Pipeline>,
}

impl Step {
    pub(crate) fn create(
        plan: &Plan,
        pos: usize,
        params: &CollectiveParams,
        config: &BuiltinConfig,
    ) -> Result<Self> {
        let phase: &Phase = plan
            .phases
            .get(pos)
            .ok_or(CollLibError::InvalidParam("phase index out of range"))?;
        let n = plan.group_size;
        let me = plan.my_index;
        let blk = params.block_length();
        let method = phase.method;

        let (buffer_length, remote_base, calc) = match method {
            PlanMethod::AllgatherBruck => {
                let distance = 1usize << pos;
                (distance.min(n - distance) * blk, distance * blk, None)
            }
            PlanMethod::AlltoallBruck => {
                let blocks = (0..n).filter(|i| i & (1 << pos) != 0).collect();
                (blk, 0, Some(SendCalc::BruckBlocks(blocks)))
            }
            PlanMethod::Pairwise => (blk, me * blk, Some(SendCalc::PeerBlock(phase.peers.clone()))),
            PlanMethod::ScatterTerminal => {
                (blk, 0, Some(SendCalc::PeerBlock(phase.peers.clone())))
            }
            PlanMethod::SendTerminal if params.kind() == CollectiveKind::Gather => {
                (blk, me * blk, None)
            }
            _ => (blk, 0, None),
        };
        let items = match &calc {
            Some(SendCalc::BruckBlocks(blocks)) => blocks.len(),
            _ => 1,
        };

        let allow_zcopy = method != PlanMethod::AlltoallBruck;
        let sizing = step_send_flags(
            buffer_length,
            params.datatype.len,
            &phase.thresholds,
            phase.max_reg,
            allow_zcopy,
        )?;

        let mut flags = StepFlags::empty();
        flags.set(StepFlags::FIRST_STEP, pos == 0);
        flags.set(StepFlags::LAST_STEP, pos + 1 == plan.phases.len());
        flags.set(StepFlags::SINGLE_ENDPOINT, phase.ep_cnt() == 1);
        let is_fragmented = sizing.flags.contains(StepFlags::FRAGMENTED);
        let pipelined = if is_fragmented && config.pipelining {
            StepFlags::PIPELINED
        } else {
            StepFlags::empty()
        };
        flags |= match method {
            PlanMethod::SendTerminal => sizing.flags,
            PlanMethod::ScatterTerminal => sizing.flags | StepFlags::CALC_SENT_BUFFERS,
            PlanMethod::RecvTerminal | PlanMethod::ReduceTerminal => {
                StepFlags::RECV_AFTER_SEND | (sizing.flags & StepFlags::FRAGMENTED)
            }
            PlanMethod::BcastWaypoint => {
                sizing.flags
                    | pipelined
                    | StepFlags::RECV1_BEFORE_SEND
                    | StepFlags::SEND_FROM_RECV_BUF
            }
            PlanMethod::ReduceWaypoint => {
                sizing.flags
                    | pipelined
                    | StepFlags::RECV_BEFORE_SEND1
                    | StepFlags::SEND_FROM_RECV_BUF
            }
            PlanMethod::ReduceRecursive | PlanMethod::AllgatherBruck => {
                sizing.flags | StepFlags::RECV_AFTER_SEND
            }
            PlanMethod::AlltoallBruck | PlanMethod::Pairwise => {
                sizing.flags | StepFlags::RECV_AFTER_SEND | StepFlags::CALC_SENT_BUFFERS
            }
        };

        let bruck = matches!(method, PlanMethod::AlltoallBruck | PlanMethod::AllgatherBruck);
        let source = if bruck {
            BufferKind::Scratch
        } else if flags.contains(StepFlags::SEND_FROM_RECV_BUF) {
            BufferKind::Recv
        } else if flags.contains(StepFlags::FIRST_STEP) && !params.in_place {
            BufferKind::Send
        } else {
            BufferKind::Recv
        };
        let target = if bruck { BufferKind::Scratch } else { BufferKind::Recv };

        let mut step = Self {
            phase: pos,
            method,
            step_idx: phase.step_index,
            flags,
            ep_cnt: phase.ep_cnt(),
            source,
            target,
            buffer_length,
            remote_base,
            fragment_length: sizing.fragment_length,
            fragments: sizing.fragments,
            items,
            calc,
            incast: phase.incast,
            batch_cnt: phase.batch_cnt as usize,
            barrier: params.coll_type.modifiers().contains(CollectiveModifiers::BARRIER),
            send_fn: send_fn_for(flags),
            recv_cb: RecvStrategy::RecvMany,
            memh: None,
            cursor: Cursor::default(),
            pipeline: flags
                .contains(StepFlags::PIPELINED)
                .then(|| Pipeline::new(sizing.fragments)),
        };
        step.recv_cb = select_recv_strategy(&step.selector_input());
        Ok(step)
    }

    pub(crate) fn selector_input(&self) -> SelectorInput {
        SelectorInput {
            method: self.method,
            fragmented: self.flags.contains(StepFlags::FRAGMENTED),
            pipelined: self.flags.contains(StepFlags::PIPELINED),
            single_msg: self.is_single_msg(),
            ep_cnt: self.ep_cnt,
            last_step: self.flags.contains(StepFlags::LAST_STEP),
            nonzero_length: self.buffer_length > 0,
            zcopy: self.is_zcopy(),
            barrier: self.barrier,
            incast: self.incast,
        }
    }

    pub fn method(&self) -> PlanMethod {
        self.method
    }

    pub fn flags(&self) -> StepFlags {
        self.flags
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    pub fn fragment_length(&self) -> usize {
        self.fragment_length
    }

    pub fn recv_strategy(&self) -> RecvStrategy {
        self.recv_cb
    }

    pub(crate) fn is_zcopy(&self) -> bool {
        self.flags.contains(StepFlags::SEND_AM_ZCOPY)
    }

    pub(crate) fn sends(&self) -> bool {
        self.flags.intersects(StepFlags::SEND_MODE)
    }

    pub(crate) fn is_single_msg(&self) -> bool {
        self.ep_cnt == 1 && self.items == 1 && !self.flags.contains(StepFlags::FRAGMENTED)
    }

    /// Messages sent (and, for exchanges, received) by this step.
    pub(crate) fn units(&self) -> usize {
        self.fragments * self.ep_cnt * self.items
    }

    /// Value of the pending counter when the step starts: zero-copy exchanges
    /// count local completions on top of arrivals.
    pub(crate) fn initial_pending(&self) -> usize {
        if self.flags.contains(StepFlags::RECV_AFTER_SEND) && self.is_zcopy() {
            2 * self.units()
        } else {
            self.units()
        }
    }

    /// First endpoint to send to once the receive-before-send prerequisite is met.
    pub(crate) fn receive_start(&self) -> usize {
        if self.flags.contains(StepFlags::RECV1_BEFORE_SEND) {
            1
        } else {
            self.ep_cnt.saturating_sub(1)
        }
    }

    /// Length of the fragment starting at `offset`.
    pub(crate) fn fragment_at(&self, offset: usize) -> usize {
        self.fragment_length.min(self.buffer_length.saturating_sub(offset))
    }

    pub(crate) fn fragment_index(&self, offset: usize) -> usize {
        offset.checked_div(self.fragment_length).unwrap_or(0)
    }

    /// (source offset, remote offset) of send item `item` to endpoint `ep`.
    pub(crate) fn locate(&self, ep: usize, item: usize) -> (usize, usize) {
        match &self.calc {
            None => (0, self.remote_base),
            Some(SendCalc::PeerBlock(peers)) => {
                let peer = peers.get(ep).copied().unwrap_or(0);
                (peer * self.buffer_length, self.remote_base)
            }
            Some(SendCalc::BruckBlocks(blocks)) => {
                let block = blocks.get(item).copied().unwrap_or(0);
                (block * self.buffer_length, block * self.buffer_length)
            }
        }
    }

    pub(crate) fn upgradable(&self, phase: &Phase) -> bool {
        self.flags.contains(StepFlags::SEND_AM_BCOPY)
            && self.buffer_length > 0
            && self.method != PlanMethod::AlltoallBruck
            && phase.max_reg > self.buffer_length
            && phase.thresholds.max_zcopy_one != crate::plan::UNLIMITED
    }

    /// Switches buffered sends to zero-copy out of `memh` and re-selects the
    /// completion handler for the new pending-counter semantics.
    pub(crate) fn upgrade_to_zcopy(&mut self, memh: MemHandle) {
        self.flags.remove(StepFlags::SEND_AM_BCOPY);
        self.flags.insert(StepFlags::SEND_AM_ZCOPY);
        self.memh = Some(memh);
        self.send_fn = send_fn_for(self.flags);
        self.recv_cb = select_recv_strategy(&self.selector_input());
    }

    pub(crate) fn reset(&mut self) {
        self.cursor = Cursor::default();
        if let Some(pipe) = self.pipeline.as_mut() {
            pipe.reset(0);
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("method", &self.method)
            .field("step_idx", &self.step_idx)
            .field("flags", &self.flags)
            .field("buffer_length", &self.buffer_length)
            .field("fragments", &self.fragments)
            .field("recv_cb", &self.recv_cb)
            .finish()
    }
}
