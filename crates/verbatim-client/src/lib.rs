//! Application layer of the Verbatim client: session lifecycle, routing
//! rules, conversations, and dashboard counters, glued to the transport
//! crates ([`verbatim_api`], [`verbatim_channel`], [`verbatim_store`]).
//!
//! The shell (whatever renders the UI) owns one [`SessionService`], one
//! [`verbatim_channel::ChannelManager`], and spawns [`ChatController`]s and
//! [`BadgeCounters`] as views come and go.

pub mod chat;
pub mod config;
pub mod convo;
pub mod counters;
pub mod error;
pub mod guard;
pub mod session;

pub use chat::{
    ChatController, MAX_ATTACHMENT_BYTES, Notifier, NullNotifier, Outgoing, OutgoingAttachment,
};
pub use config::ClientConfig;
pub use convo::{Conversation, Draft, Reconciled};
pub use counters::BadgeCounters;
pub use error::ClientError;
pub use guard::{Access, Route, evaluate, landing};
pub use session::{SessionService, SessionState};
