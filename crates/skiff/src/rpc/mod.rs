//! RPC transport A: multiplexed request/response sessions.
//!
//! One byte stream carries a mux session (see [`crate::mux`]). Three
//! substreams are opened eagerly by the host: a control channel hosting the
//! `Dispenser` and `Control` services, and the plugin's stdout and stderr
//! feeds. Every dispensed service gets its own substream, rendezvoused
//! through the mux broker. Calls travel as delimited JSON envelopes
//! ([`protocol::Envelope`]) with per-stream sequence correlation.

mod client;
pub mod protocol;
mod server;

pub use client::{RpcClientProtocol, RpcServiceHandle};
pub use server::serve_session;
