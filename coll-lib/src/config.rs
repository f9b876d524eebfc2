use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};

use crate::error::{CollLibError, Result};

pub const DEFAULT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_SHORT_MAX_TX: usize = 256;
pub const DEFAULT_BCOPY_MAX_TX: usize = 32768;
pub const DEFAULT_MEM_REG_OPT_CNT: u32 = 10;
pub const DEFAULT_RECURSIVE_FACTOR: usize = 2;
pub const DEFAULT_TREE_RADIX: usize = 4;

/// Tuning of the builtin planner and data path.
#[derive(Debug, Clone, PartialEq, Eq, Parser, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltinConfig {
    /// Maximum number of operations cached per plan.
    #[clap(long, env = "COLL_BUILTIN_CACHE_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,

    /// Largest send (header included) that may use inline messages.
    #[clap(
        long,
        env = "COLL_BUILTIN_SHORT_MAX_TX_SIZE",
        default_value_t = DEFAULT_SHORT_MAX_TX
    )]
    pub short_max_tx: usize,

    /// Largest send (header included) that may use buffered copies when the
    /// transport can register memory.
    #[clap(
        long,
        env = "COLL_BUILTIN_BCOPY_MAX_TX_SIZE",
        default_value_t = DEFAULT_BCOPY_MAX_TX
    )]
    pub bcopy_max_tx: usize,

    /// Number of uses after which buffered steps switch to zero-copy.
    #[clap(
        long,
        env = "COLL_BUILTIN_MEM_REG_OPT_CNT",
        default_value_t = DEFAULT_MEM_REG_OPT_CNT
    )]
    pub mem_reg_opt_cnt: u32,

    /// Radix of recursive K-ing (2 is recursive doubling).
    #[clap(
        long,
        env = "COLL_BUILTIN_RECURSIVE_FACTOR",
        default_value_t = DEFAULT_RECURSIVE_FACTOR
    )]
    pub recursive_factor: usize,

    /// Radix of the k-nomial fan-in/fan-out trees.
    #[clap(long, env = "COLL_BUILTIN_TREE_RADIX", default_value_t = DEFAULT_TREE_RADIX)]
    pub tree_radix: usize,

    /// Forward completed fragments of a waypoint before the whole message arrived.
    #[clap(
        long,
        env = "COLL_BUILTIN_PIPELINING",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub pipelining: bool,
}

impl Default for BuiltinConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            short_max_tx: DEFAULT_SHORT_MAX_TX,
            bcopy_max_tx: DEFAULT_BCOPY_MAX_TX,
            mem_reg_opt_cnt: DEFAULT_MEM_REG_OPT_CNT,
            recursive_factor: DEFAULT_RECURSIVE_FACTOR,
            tree_radix: DEFAULT_TREE_RADIX,
            pipelining: true,
        }
    }
}

impl BuiltinConfig {
    pub fn validate(&self) -> Result<()> {
        if self.recursive_factor < 2 {
            return Err(CollLibError::Config(format!(
                "recursive factor must be at least 2, got {}",
                self.recursive_factor
            )));
        }
        if self.tree_radix < 2 {
            return Err(CollLibError::Config(format!(
                "tree radix must be at least 2, got {}",
                self.tree_radix
            )));
        }
        if self.cache_size == 0 {
            return Err(CollLibError::Config("cache size must not be zero".into()));
        }
        Ok(())
    }
}
