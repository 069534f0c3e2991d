use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use verbatim_types::events::{ClientCommand, RealtimeEvent};

/// One frame off the wire, already decoded.
#[derive(Debug)]
pub enum Frame {
    Event(RealtimeEvent),
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server ended the connection in an orderly way.
    ServerClosed,
    /// The socket died underneath us.
    Transport(String),
}

/// A live duplex pipe to the gateway. Dropping either half ends the
/// connection; the transport task behind it shuts down on its own.
pub struct Connection {
    pub commands: mpsc::Sender<ClientCommand>,
    pub frames: mpsc::Receiver<Frame>,
}

/// Transport seam. The manager never touches a socket directly, so tests
/// drive the whole connection state machine with a scripted implementation.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str, token: &str) -> BoxFuture<'static, anyhow::Result<Connection>>;
}
