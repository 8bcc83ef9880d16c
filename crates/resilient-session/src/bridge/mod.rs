//! IPC bridge between the supervisor and its worker.
//!
//! # Architecture
//!
//! - **protocol**: envelope, typed messages, replies
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **correlator**: request/response matching and inbound routing

pub mod codec;
pub mod correlator;
pub mod protocol;

pub use correlator::{
    ChannelError, Correlator, CorrelatorConfig, HandlerMap, Router, router_fn,
};
pub use protocol::{Envelope, ErrorLike, Message, Reply};
