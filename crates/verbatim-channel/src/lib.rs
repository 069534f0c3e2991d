//! Real-time gateway channel for the Verbatim client.
//!
//! One process holds at most one gateway session. [`ChannelManager`] owns it:
//! callers ask for a [`ChannelHandle`] and subscribe to the event fan-out;
//! the manager runs the connection, the identify handshake, room membership
//! and reconnection behind their backs.
//!
//! The transport is injected through the [`Connector`] trait so the whole
//! state machine runs against an in-memory fake in tests. [`WsConnector`] is
//! the production implementation.

pub mod connector;
pub mod manager;
pub mod ws;

pub use connector::{CloseReason, Connection, Connector, Frame};
pub use manager::{ChannelError, ChannelHandle, ChannelManager, ChannelStatus, EventSubscription};
pub use ws::WsConnector;
