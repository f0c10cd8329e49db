//! Serves the measurement log over a minimal HTTP-like line protocol.

#[macro_use]
extern crate tracing;

mod listener;
mod pool;
pub mod protocol;

pub use listener::{
    ListenerHandle,
    RequestListener,
    MAX_REQUEST_LINE,
};
pub use pool::{
    Saturated,
    WorkerPool,
    WorkerSlot,
};
pub use protocol::{
    parse_request,
    ProtocolError,
    RequestSpec,
    RequestType,
    Response,
    Status,
    TimeUnit,
};
