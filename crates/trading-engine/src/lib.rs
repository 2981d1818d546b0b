//! Trading engine: order tracking, dispatch and the live/replay loop.
//!
//! Market events flow through candle aggregation into the strategy, then
//! the risk checks, then the [`OrderDispatcher`]. Order results and
//! exchange reports are folded back into the [`OrderTracker`] on the
//! engine's own task.

mod dispatcher;
mod runtime;
mod stats;
mod tracker;

pub use dispatcher::{Command, CommandOutput, CommandResult, DispatcherConfig, OrderDispatcher};
pub use runtime::{Engine, EngineConfig};
pub use stats::SessionStats;
pub use tracker::OrderTracker;
