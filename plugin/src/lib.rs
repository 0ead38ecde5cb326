//! Instrumentation for translated blocks.
//!
//! The translator emits markers through [`PluginGen`] while decoding;
//! once the block is complete a [`RequestCollector`] fills the callback
//! lists of the [`InstrumentedBlock`] and [`PluginGen::inject`] replaces
//! every marker with the code for those callbacks.

pub mod block;
pub mod callback;
mod gen;
pub mod inject;
pub mod scoreboard;
pub mod vcpu;

use thiserror::Error;

pub use block::{InstrumentedBlock, InstrumentedInsn};
pub use callback::{
    CallbackDescriptor, CbFlags, CondCb, InlineCb, InlineOp, PluginCond, RegularCb,
};
pub use inject::{InjectStats, InjectedBlock, PluginGen, RequestCollector};
pub use scoreboard::{Scoreboard, ScoreboardRef};
pub use vcpu::{vcpu_mem_cb, HelperMemCbs, VcpuLayout, VcpuPluginState};

/// Errors reported when registering instrumentation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("scoreboard field at offset {offset} is not 8-byte aligned")]
    MisalignedField { offset: usize },
    #[error("scoreboard field at offset {offset} overruns {size}-byte slot")]
    FieldOutOfBounds { offset: usize, size: usize },
    #[error("memory callback registered for no access direction")]
    EmptyRwMask,
}
