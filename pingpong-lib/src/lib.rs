pub mod api;
mod abort;
mod barrier;
mod buffer;
mod channel;
mod config;
mod driver;
mod error;
mod handshake;
mod loopback;
#[cfg(feature = "ofi")]
mod ofi;
mod policy;
mod progress;
mod provider;
mod report;
mod session;
mod sweep;

pub use abort::AbortSignal;
pub use barrier::{Barrier, BarrierHandle};
pub use buffer::{CONTROL_MSG_SIZE, ChannelBuffer, ChannelBuffers};
pub use channel::{ATOMIC_ELEM_SIZE, CQ_BATCH, Channel};
pub use config::{
    BUFFER_ALIGN, BenchConfig, Direction, ExecutionModel, MAX_MSG_SIZE, MAX_NUM_CHANNELS,
    MIN_MSG_SIZE, Role, TestMode,
};
pub use driver::{AtomicLimits, Driver, Step, test_plan};
pub use error::*;
pub use handshake::{exchange_addresses, exchange_rma};
pub use loopback::{LoopbackFabric, LoopbackOptions, LoopbackProvider, LoopbackTransport};
#[cfg(feature = "ofi")]
pub use ofi::{OfiChannel, OfiProvider};
pub use policy::{
    AtomicKind, AtomicPolicy, MessagePolicy, Phase, RmaOp, RmaPolicy, UnitOfWork, Workload,
};
pub use progress::{ChannelGroup, Dedicated, ProgressDiscipline, SharedProgress};
pub use provider::{ChannelTransport, Provider};
pub use report::{Measurement, Reporter};
pub use session::{ChannelSummary, run};
pub use sweep::{SizeSweep, SweepPoint, repeat_for};

#[cfg(test)]
mod test_pingpong;
