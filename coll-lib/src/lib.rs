pub mod api;
mod config;
mod engine;
mod error;
mod group;
mod interface;
mod loopback;
mod op;
mod plan;
mod reducer;
mod slot;
pub mod topo;

#[cfg(test)]
mod test_exec;

pub use config::BuiltinConfig;
pub use engine::CollEngine;
pub use error::*;
pub use group::{Group, GroupParams, GroupStats};
pub use interface::{Endpoint, Reducer, Transport};
pub use loopback::{LoopbackCluster, LoopbackFabric, SendMode, SentMessage};
pub use op::{
    BufferKind, ExecStatus, OpBuffers, Operation, RecvStrategy, SelectorInput, SendSizing,
    Step, StepFlags, select_recv_strategy, step_send_flags,
};
pub use plan::{Phase, Plan, Thresholds, UNLIMITED};
pub use reducer::{BasicDatatype, BasicOp, BasicReducer, i32_bytes, i32_values};
pub use slot::MAX_CONCURRENT_OPS;

pub use interface::{MockEndpoint, MockTransport};
