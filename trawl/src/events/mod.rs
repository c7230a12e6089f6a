//! Event bus: typed events, an emitter with bounded fan-out, and the
//! built-in observers.

pub mod emitter;
pub mod observers;
pub mod types;

pub use emitter::{EmitterConfig, EmitterStats, EventEmitter, EventSelector};
pub use observers::{
    ConsoleObserver, JsonlObserver, Observer, RunTotals, StatisticsObserver, TracingObserver,
};
pub use types::{Event, EventKind, EventPayload, StagePhase};
