//! Recording: session lifecycle, exchange tracking and finalization

mod recorder;
mod session;
mod tracker;

pub use recorder::Recorder;
pub use session::RecorderStats;
pub use tracker::{
    ChunkOutcome, CompleteOutcome, ExchangeState, ExchangeTracker, FinishedExchange, OpenOutcome,
};
