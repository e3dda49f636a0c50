//! Inbound sync: catch-up fetch, live channel and the activation flow.

mod catch_up;
mod engine;
mod live;
pub mod sse;
#[cfg(test)]
mod testing;

pub use catch_up::{CatchUpSource, HttpCatchUpClient};
pub use engine::{ActivationReport, CatchUpOutcome, SyncEngine};
pub use live::{
    ChannelState, LiveChannel, LiveSubscription, LiveTransport, SseTransport, SupervisorHandle,
    TransportEvent, UpdateSink,
};
