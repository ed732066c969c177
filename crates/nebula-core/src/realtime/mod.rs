//! Realtime client for the backend's change feed
//!
//! ## Protocol
//!
//! Phoenix channels over a websocket:
//! 1. Connect to `{endpoint}/websocket?apikey=..&vsn=1.0.0`
//! 2. Send `phx_join` on `realtime:{channel}` with a `postgres_changes` config
//! 3. Receive `postgres_changes` frames until `phx_leave`
//! 4. Send a heartbeat on the `phoenix` topic every interval

mod client;
mod message;

pub use client::{RealtimeClient, RealtimeConfig, TokenSource};
pub use message::{change_from_payload, Frame, ServerFrame};
