//! Operations: a plan instantiated for one collective shape, reusable across
//! invocations.

mod comp;
pub(crate) mod exec;
mod step;

use std::sync::Arc;

use tracing::{debug, warn};

pub use comp::{RecvStrategy, SelectorInput, select_recv_strategy};
pub use exec::ExecStatus;
pub use step::{BufferKind, SendSizing, Step, StepFlags, step_send_flags};

pub(crate) use comp::{on_message, on_zcopy_completion};

use crate::{
    api::{CollectiveKind, CollectiveParams, MemHandle, OpId},
    config::BuiltinConfig,
    error::{CollLibError, Result},
    interface::Transport,
    plan::Plan,
    topo::TopologyType,
};

/// The buffers owned by an operation. Their sizes never change after
/// creation, so registered regions stay valid for the operation's lifetime.
#[derive(Debug, Default)]
pub struct OpBuffers {
    send: Vec<u8>,
    recv: Vec<u8>,
    scratch: Vec<u8>,
}

impl OpBuffers {
    fn new(send: usize, recv: usize, scratch: usize) -> Self {
        Self { send: vec![0; send], recv: vec![0; recv], scratch: vec![0; scratch] }
    }

    pub fn get(&self, kind: BufferKind) -> &[u8] {
        match kind {
            BufferKind::Send => &self.send,
            BufferKind::Recv => &self.recv,
            BufferKind::Scratch => &self.scratch,
        }
    }

    pub fn get_mut(&mut self, kind: BufferKind) -> &mut [u8] {
        match kind {
            BufferKind::Send => &mut self.send,
            BufferKind::Recv => &mut self.recv,
            BufferKind::Scratch => &mut self.scratch,
        }
    }
}

/// What runs before the first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitStrategy {
    None,
    /// Copy `len` bytes of the send buffer at `src` into the receive buffer at `dst`.
    CopyBlock { src: usize, dst: usize, len: usize },
    /// scratch block `i` = send block `(me + i) mod n`.
    BruckAlltoall,
    /// scratch block 0 = the local contribution.
    BruckAllgather,
}

/// What runs after the last step completed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FiniStrategy {
    None,
    /// receive block `(me - i) mod n` = scratch block `i`.
    BruckUnrotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Optimization {
    None,
    /// Upgrade buffered steps to zero-copy once `remaining` more starts happened.
    BcopyToZcopy { remaining: u32 },
}

pub struct Operation {
    pub(crate) id: OpId,
    pub(crate) params: CollectiveParams,
    pub(crate) plan: Arc<Plan>,
    pub(crate) steps: Vec<Step>,
    pub(crate) buffers: OpBuffers,
    init: InitStrategy,
    fini: FiniStrategy,
    optimization: Optimization,
    memhs: Vec<(BufferKind, MemHandle)>,
    /// Set while the operation occupies a slot.
    pub(crate) active: bool,
    transport: Arc<dyn Transport>,
}

fn check_in_place(params: &CollectiveParams) -> Result<()> {
    if params.in_place && !params.kind().is_symmetric() {
        return Err(CollLibError::InvalidParam("in-place is not supported for this collective"));
    }
    Ok(())
}

fn init_strategy(params: &CollectiveParams, plan: &Plan) -> InitStrategy {
    let blk = params.block_length();
    let me = plan.my_index;
    let is_root = me == params.coll_type.root;
    let copy = |src, dst| InitStrategy::CopyBlock { src, dst, len: blk };
    match plan.topology {
        TopologyType::AlltoallBruck => return InitStrategy::BruckAlltoall,
        TopologyType::AllgatherBruck => return InitStrategy::BruckAllgather,
        _ => {}
    }
    if blk == 0 {
        return InitStrategy::None;
    }
    match params.kind() {
        CollectiveKind::Bcast if is_root && !params.in_place => copy(0, 0),
        CollectiveKind::Reduce | CollectiveKind::Allreduce if !params.in_place => copy(0, 0),
        CollectiveKind::Gather if is_root => copy(0, me * blk),
        CollectiveKind::Scatter if is_root => copy(me * blk, 0),
        CollectiveKind::Alltoall => copy(me * blk, me * blk),
        _ => InitStrategy::None,
    }
}

impl Operation {
    pub(crate) fn create(
        id: OpId,
        params: CollectiveParams,
        plan: Arc<Plan>,
        config: &BuiltinConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        check_in_place(&params)?;
        if params.coll_type != plan.coll_type {
            return Err(CollLibError::InvalidParam("plan built for another collective"));
        }
        let n = plan.group_size;
        let (send_len, recv_len) = params.buffer_lengths(n, plan.my_index);
        let scratch_len = match plan.topology {
            TopologyType::AlltoallBruck | TopologyType::AllgatherBruck => {
                n * params.block_length()
            }
            _ => 0,
        };

        let steps = (0..plan.phases.len())
            .map(|pos| Step::create(&plan, pos, &params, config))
            .collect::<Result<Vec<_>>>()?;

        let upgradable = steps
            .iter()
            .any(|step| step.upgradable(&plan.phases[step.phase]));
        let optimization = if upgradable && config.mem_reg_opt_cnt > 0 {
            Optimization::BcopyToZcopy { remaining: config.mem_reg_opt_cnt }
        } else {
            Optimization::None
        };

        let mut op = Self {
            id,
            init: init_strategy(&params, &plan),
            fini: match plan.topology {
                TopologyType::AlltoallBruck | TopologyType::AllgatherBruck => {
                    FiniStrategy::BruckUnrotate
                }
                _ => FiniStrategy::None,
            },
            params,
            plan,
            steps,
            buffers: OpBuffers::new(send_len, recv_len, scratch_len),
            optimization,
            memhs: Vec::new(),
            active: false,
            transport,
        };

        for i in 0..op.steps.len() {
            if !op.steps[i].is_zcopy() {
                continue;
            }
            let source = op.steps[i].source;
            match op.register(source) {
                Ok(memh) => op.steps[i].memh = Some(memh),
                Err(e) => {
                    op.discard();
                    return Err(e);
                }
            }
        }

        debug!(
            op_id = op.id.0,
            kind = ?op.params.kind(),
            steps = op.steps.len(),
            optimization = ?op.optimization,
            "Created collective operation"
        );
        Ok(op)
    }

    /// Registers the buffer of `kind`, reusing an earlier registration.
    fn register(&mut self, kind: BufferKind) -> Result<MemHandle> {
        if let Some((_, memh)) = self.memhs.iter().find(|(k, _)| *k == kind) {
            return Ok(*memh);
        }
        let memh = self.transport.mem_reg(self.buffers.get(kind))?;
        self.memhs.push((kind, memh));
        Ok(memh)
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn params(&self) -> &CollectiveParams {
        &self.params
    }

    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn send_buffer(&self) -> &[u8] {
        self.buffers.get(BufferKind::Send)
    }

    pub fn send_buffer_mut(&mut self) -> &mut [u8] {
        self.buffers.get_mut(BufferKind::Send)
    }

    pub fn recv_buffer(&self) -> &[u8] {
        self.buffers.get(BufferKind::Recv)
    }

    pub fn recv_buffer_mut(&mut self) -> &mut [u8] {
        self.buffers.get_mut(BufferKind::Recv)
    }

    /// Counts one start towards the zero-copy upgrade and performs it when due.
    pub(crate) fn tick_optimization(&mut self) {
        let Optimization::BcopyToZcopy { remaining } = &mut self.optimization else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return;
        }
        self.optimization = Optimization::None;
        if let Err(e) = self.upgrade_to_zcopy() {
            warn!(op_id = self.id.0, %e, "Zero-copy upgrade failed, keeping buffered sends");
        }
    }

    fn upgrade_to_zcopy(&mut self) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let targets: Vec<(usize, BufferKind)> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.upgradable(&plan.phases[step.phase]))
            .map(|(i, step)| (i, step.source))
            .collect();
        // All or nothing: no step flips unless every source registered.
        let handles = targets
            .iter()
            .map(|&(_, source)| self.register(source))
            .collect::<Result<Vec<_>>>()?;
        for (&(i, _), memh) in targets.iter().zip(handles) {
            self.steps[i].upgrade_to_zcopy(memh);
        }
        debug!(op_id = self.id.0, upgraded = targets.len(), "Upgraded buffered steps to zero-copy");
        Ok(())
    }

    pub(crate) fn run_init(&mut self) -> Result<()> {
        let n = self.plan.group_size;
        let me = self.plan.my_index;
        let blk = self.params.block_length();
        let OpBuffers { send, recv, scratch } = &mut self.buffers;
        match self.init {
            InitStrategy::None => {}
            InitStrategy::CopyBlock { src, dst, len } => {
                let from = send
                    .get(src..src + len)
                    .ok_or(CollLibError::InvalidParam("init copy outside the send buffer"))?;
                recv.get_mut(dst..dst + len)
                    .ok_or(CollLibError::InvalidParam("init copy outside the receive buffer"))?
                    .copy_from_slice(from);
            }
            InitStrategy::BruckAlltoall => {
                for (i, block) in scratch.chunks_exact_mut(blk.max(1)).take(n).enumerate() {
                    let from = ((me + i) % n) * blk;
                    block.copy_from_slice(&send[from..from + blk]);
                }
            }
            InitStrategy::BruckAllgather => {
                scratch[..blk].copy_from_slice(&send[..blk]);
            }
        }
        Ok(())
    }

    pub(crate) fn run_fini(&mut self) -> Result<()> {
        let n = self.plan.group_size;
        let me = self.plan.my_index;
        let blk = self.params.block_length();
        match self.fini {
            FiniStrategy::None => {}
            FiniStrategy::BruckUnrotate => {
                let OpBuffers { recv, scratch, .. } = &mut self.buffers;
                if recv.len() < n * blk || scratch.len() < n * blk {
                    return Err(CollLibError::InvalidParam("Bruck buffers too short"));
                }
                for i in 0..n {
                    let to = ((me + n - i) % n) * blk;
                    recv[to..to + blk].copy_from_slice(&scratch[i * blk..(i + 1) * blk]);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn reset_steps(&mut self) {
        self.steps.iter_mut().for_each(Step::reset);
    }

    /// Releases the registered memory of the operation.
    pub(crate) fn discard(&mut self) {
        for (_, memh) in self.memhs.drain(..) {
            if let Err(e) = self.transport.mem_dereg(memh) {
                warn!(op_id = self.id.0, %e, "Failed to deregister collective buffer");
            }
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("steps", &self.steps)
            .field("active", &self.active)
            .finish()
    }
}
