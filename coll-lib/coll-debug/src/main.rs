use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use coll_lib::{
    BasicDatatype, BasicOp, BasicReducer, BuiltinConfig, GroupStats, LoopbackCluster,
    LoopbackFabric, Plan, Reducer,
    api::{
        CollectiveKind, CollectiveParams, CollectiveType, EndpointAttr, GroupId, IfaceFlags,
        MemberIndex,
    },
};
use logging_lib::LoggingOpts;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(about = "Inspect and exercise collective plans over the loopback fabric")]
struct Cli {
    #[clap(flatten)]
    logging: LoggingOpts,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the plan one member builds for a collective.
    Plan {
        #[clap(long, value_enum)]
        kind: CollectiveKind,
        #[clap(long, short = 'n')]
        members: usize,
        #[clap(long, default_value_t = 0)]
        member: MemberIndex,
        #[clap(long, default_value_t = 0)]
        root: MemberIndex,
        #[clap(flatten)]
        fabric: FabricOpts,
        #[clap(flatten)]
        config: BuiltinConfig,
    },
    /// Run a collective on every member and report the outcome as JSON.
    Run {
        #[clap(long, value_enum)]
        kind: CollectiveKind,
        #[clap(long, short = 'n')]
        members: usize,
        #[clap(long, default_value_t = 0)]
        root: MemberIndex,
        /// Elements contributed by each member.
        #[clap(long, default_value_t = 64)]
        count: usize,
        #[clap(long, value_enum, default_value = "i32")]
        datatype: BasicDatatype,
        #[clap(long, value_enum, default_value = "sum")]
        op: BasicOp,
        /// Number of times the collective is started.
        #[clap(long, default_value_t = 1)]
        iterations: usize,
        /// Back-pressure fault as `member:nth`, failing the nth send attempt
        /// of that member. May be repeated.
        #[clap(long = "inject", value_parser = parse_fault)]
        faults: Vec<(MemberIndex, usize)>,
        #[clap(long, default_value_t = 10_000)]
        max_rounds: usize,
        #[clap(flatten)]
        fabric: FabricOpts,
        #[clap(flatten)]
        config: BuiltinConfig,
    },
}

#[derive(Debug, Args)]
struct FabricOpts {
    #[clap(long, default_value_t = 128)]
    max_short: usize,
    #[clap(long, default_value_t = 8192)]
    max_bcopy: usize,
    #[clap(long, default_value_t = 65536)]
    max_zcopy: usize,
    /// Largest registrable region; 0 disables zero-copy.
    #[clap(long, default_value_t = 1 << 20)]
    max_reg: usize,
    #[clap(long)]
    no_short: bool,
    #[clap(long)]
    no_zcopy: bool,
}

impl FabricOpts {
    fn attr(&self) -> EndpointAttr {
        let mut flags = IfaceFlags::all();
        flags.set(IfaceFlags::AM_SHORT, !self.no_short);
        flags.set(IfaceFlags::AM_ZCOPY, !self.no_zcopy);
        EndpointAttr {
            flags,
            max_short: self.max_short,
            max_bcopy: self.max_bcopy,
            max_zcopy: self.max_zcopy,
            ..Default::default()
        }
    }
}

fn parse_fault(s: &str) -> anyhow::Result<(MemberIndex, usize)> {
    let (member, nth) = s.split_once(':').ok_or_else(|| anyhow!("expected member:nth"))?;
    Ok((member.parse()?, nth.parse()?))
}

#[derive(Serialize)]
struct MemberReport {
    member: MemberIndex,
    verified: bool,
    stats: GroupStats,
}

#[derive(Serialize)]
struct RunReport {
    kind: CollectiveKind,
    members: usize,
    count: usize,
    datatype: BasicDatatype,
    rounds: Vec<usize>,
    messages: usize,
    results: Vec<MemberReport>,
}

fn encode(datatype: BasicDatatype, value: i64) -> Vec<u8> {
    match datatype {
        BasicDatatype::U8 => vec![value as u8],
        BasicDatatype::I32 => (value as i32).to_le_bytes().to_vec(),
        BasicDatatype::I64 => value.to_le_bytes().to_vec(),
        BasicDatatype::F32 => (value as f32).to_le_bytes().to_vec(),
        BasicDatatype::F64 => (value as f64).to_le_bytes().to_vec(),
    }
}

/// Send buffer contents of `member`: small distinct values per element.
fn input(params: &CollectiveParams, datatype: BasicDatatype, n: usize, member: usize) -> Vec<u8> {
    let (send_len, _) = params.buffer_lengths(n, member);
    let elements = send_len / datatype.size();
    (0..elements)
        .flat_map(|i| encode(datatype, (member + 1) as i64 + (i % 7) as i64))
        .collect()
}

/// What member `member` must hold in its receive buffer, if anything.
fn expected(
    params: &CollectiveParams,
    inputs: &[Vec<u8>],
    member: MemberIndex,
    reducer: &dyn Reducer,
) -> Option<Vec<u8>> {
    let n = inputs.len();
    let root = params.coll_type.root;
    let blk = params.block_length();
    let block = |m: usize, j: usize| &inputs[m][j * blk..(j + 1) * blk];
    match params.kind() {
        CollectiveKind::Barrier => None,
        CollectiveKind::Bcast => Some(inputs[root].clone()),
        CollectiveKind::Reduce if member != root => None,
        CollectiveKind::Reduce | CollectiveKind::Allreduce => {
            let mut acc = inputs[0].clone();
            for src in &inputs[1..] {
                reducer.reduce(params.op, src, &mut acc, params.count, params.datatype.id);
            }
            Some(acc)
        }
        CollectiveKind::Gather if member != root => None,
        CollectiveKind::Gather | CollectiveKind::Allgather => Some(inputs.concat()),
        CollectiveKind::Scatter => Some(block(root, member).to_vec()),
        CollectiveKind::Alltoall => Some((0..n).flat_map(|j| block(j, member).to_vec()).collect()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    kind: CollectiveKind,
    n: usize,
    root: MemberIndex,
    count: usize,
    datatype: BasicDatatype,
    op: BasicOp,
    iterations: usize,
    faults: &[(MemberIndex, usize)],
    max_rounds: usize,
    fabric: &FabricOpts,
    config: BuiltinConfig,
) -> anyhow::Result<RunReport> {
    let reducer = Arc::new(BasicReducer);
    let cluster = LoopbackCluster::new(n, fabric.attr(), fabric.max_reg, config, reducer.clone())
        .context("Failed to build the loopback cluster")?;
    for &(member, nth) in faults {
        cluster.fabric().inject_no_resource(member, nth);
    }

    let params = match kind {
        CollectiveKind::Barrier => CollectiveParams::barrier(),
        kind => CollectiveParams::new(kind, count, datatype.datatype())
            .with_root(root)
            .with_op(op.id()),
    };
    let inputs: Vec<_> = (0..n).map(|m| input(&params, datatype, n, m)).collect();

    let mut rounds = Vec::with_capacity(iterations);
    let mut ops = Vec::new();
    for iteration in 0..iterations {
        ops = cluster.create_all(&params)?;
        for (member, &op_id) in ops.iter().enumerate() {
            cluster.group(member)?.send_buffer_mut(op_id)?.copy_from_slice(&inputs[member]);
        }
        let reqs = cluster.start_all(&ops)?;
        let taken = cluster.run(&reqs, max_rounds)?;
        for req in &reqs {
            if let Some(Err(e)) = req.status() {
                return Err(anyhow!("collective {} failed: {e}", req.coll_id()));
            }
        }
        info!(iteration, rounds = taken, "Collective completed on every member");
        rounds.push(taken);
    }

    let results = (0..ops.len())
        .map(|member| {
            let group = cluster.group(member)?;
            let verified = match expected(&params, &inputs, member, reducer.as_ref()) {
                Some(want) => group.recv_buffer(ops[member])? == want.as_slice(),
                None => true,
            };
            Ok(MemberReport { member, verified, stats: group.stats().clone() })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(RunReport {
        kind,
        members: n,
        count: params.count,
        datatype,
        rounds,
        messages: cluster.fabric().sent().len(),
        results,
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging_lib::init(&cli.logging)?;

    match cli.command {
        Command::Plan { kind, members, member, root, fabric, config } => {
            config.validate()?;
            let transport = LoopbackFabric::new(members, fabric.attr(), fabric.max_reg)
                .transport(member);
            let plan = Plan::build(
                GroupId(1),
                members,
                member,
                false,
                CollectiveType { kind, root },
                &config,
                transport.as_ref(),
            )?;
            print!("{plan}");
        }
        Command::Run {
            kind,
            members,
            root,
            count,
            datatype,
            op,
            iterations,
            faults,
            max_rounds,
            fabric,
            config,
        } => {
            let report = run(
                kind, members, root, count, datatype, op, iterations, &faults, max_rounds,
                &fabric, config,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.results.iter().any(|r| !r.verified) {
                return Err(anyhow!("receive buffers differ from the expected result"));
            }
        }
    }
    Ok(())
}
