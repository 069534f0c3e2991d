use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use verbatim_types::events::{ClientCommand, RealtimeEvent, Room};

use crate::connector::{CloseReason, Connection, Connector, Frame};

/// How long the server gets to answer Identify with Ready.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff: 1s doubling to 30s, ±50% jitter.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const EVENT_FANOUT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
}

type CommandSink = Arc<Mutex<Option<mpsc::Sender<ClientCommand>>>>;

/// Owns the process-wide gateway session.
///
/// `connect` is idempotent per user: asking again for the same identity hands
/// out another handle onto the running session. Asking for a *different*
/// identity tears the old session down first; subscriptions taken under the
/// old identity are dead from that point and yield nothing further, not even
/// events they had buffered but not yet drained.
pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    gateway_url: String,
    session: Mutex<Option<Session>>,
}

impl ChannelManager {
    pub fn new(gateway_url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            gateway_url: gateway_url.into(),
            session: Mutex::new(None),
        }
    }

    /// Start (or reuse) the session for `user_id`. Returns immediately; the
    /// handle's status watch reports connection progress.
    pub fn connect(&self, user_id: Uuid, token: &str) -> ChannelHandle {
        let mut session = self.session.lock().expect("session lock poisoned");

        if let Some(existing) = session.as_ref() {
            if existing.user_id == user_id {
                return existing.handle();
            }
            info!(
                "Channel identity changed ({} -> {}), tearing down old session",
                existing.user_id, user_id
            );
        }
        if let Some(old) = session.take() {
            old.shutdown();
        }

        let new = Session::spawn(
            self.connector.clone(),
            self.gateway_url.clone(),
            user_id,
            token.to_string(),
        );
        let handle = new.handle();
        *session = Some(new);
        handle
    }

    /// Tear the session down. Never reconnects on its own afterwards; safe to
    /// call when already disconnected.
    pub fn disconnect(&self) {
        let mut session = self.session.lock().expect("session lock poisoned");
        if let Some(old) = session.take() {
            info!("Channel disconnected for {}", old.user_id);
            old.shutdown();
        }
    }
}

struct Session {
    user_id: Uuid,
    events_tx: broadcast::Sender<RealtimeEvent>,
    status_tx: watch::Sender<ChannelStatus>,
    status_rx: watch::Receiver<ChannelStatus>,
    sink: CommandSink,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Session {
    fn spawn(connector: Arc<dyn Connector>, url: String, user_id: Uuid, token: String) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_FANOUT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let sink: CommandSink = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run_session(
            connector,
            url,
            user_id,
            token,
            events_tx.clone(),
            status_tx.clone(),
            sink.clone(),
        ));

        Self {
            user_id,
            events_tx,
            status_tx,
            status_rx,
            sink,
            alive: Arc::new(AtomicBool::new(true)),
            task,
        }
    }

    fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            user_id: self.user_id,
            events: self.events_tx.subscribe(),
            status: self.status_rx.clone(),
            sink: self.sink.clone(),
            alive: self.alive.clone(),
        }
    }

    fn shutdown(self) {
        // Flag first: subscriptions must stop yielding before anything else
        // about the teardown becomes observable.
        self.alive.store(false, Ordering::Release);
        self.task.abort();
        self.status_tx.send_replace(ChannelStatus::Disconnected);
        *self.sink.lock().expect("sink lock poisoned") = None;
        // Dropping `self` drops the last event sender, so subscribers still
        // parked in recv wake up and observe closure.
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.task.abort();
    }
}

/// A caller's view of the session. Cheap to clone and hand around.
pub struct ChannelHandle {
    user_id: Uuid,
    events: broadcast::Receiver<RealtimeEvent>,
    status: watch::Receiver<ChannelStatus>,
    sink: CommandSink,
    alive: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Fresh subscription to the event fan-out, starting at the tail. The
    /// subscription dies with the session it came from.
    pub fn events(&self) -> EventSubscription {
        EventSubscription {
            rx: self.events.resubscribe(),
            alive: self.alive.clone(),
        }
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Ask the gateway for membership in `room`. Fails when there is no live
    /// transport; the caller decides whether to retry after reconnect.
    pub async fn join(&self, room: Room) -> Result<(), ChannelError> {
        self.send(ClientCommand::Join { room }).await
    }

    pub async fn leave(&self, room: Room) -> Result<(), ChannelError> {
        self.send(ClientCommand::Leave { room }).await
    }

    async fn send(&self, cmd: ClientCommand) -> Result<(), ChannelError> {
        let sender = self
            .sink
            .lock()
            .expect("sink lock poisoned")
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        sender.send(cmd).await.map_err(|_| ChannelError::NotConnected)
    }
}

impl Clone for ChannelHandle {
    fn clone(&self) -> Self {
        Self {
            user_id: self.user_id,
            events: self.events.resubscribe(),
            status: self.status.clone(),
            sink: self.sink.clone(),
            alive: self.alive.clone(),
        }
    }
}

/// One subscriber's tap on the session's event fan-out.
///
/// Bound to the session it was created under: after that session is torn
/// down, `recv` only ever reports closure. Events the broadcast buffer still
/// held at teardown are discarded, not delivered late -- a handler subscribed
/// under one identity must never fire once another identity is connected.
pub struct EventSubscription {
    rx: broadcast::Receiver<RealtimeEvent>,
    alive: Arc<AtomicBool>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<RealtimeEvent, broadcast::error::RecvError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(broadcast::error::RecvError::Closed);
        }
        let event = self.rx.recv().await?;
        // The session may have died while this event sat in the buffer.
        if !self.alive.load(Ordering::Acquire) {
            return Err(broadcast::error::RecvError::Closed);
        }
        Ok(event)
    }

    pub fn try_recv(&mut self) -> Result<RealtimeEvent, broadcast::error::TryRecvError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(broadcast::error::TryRecvError::Closed);
        }
        let event = self.rx.try_recv()?;
        if !self.alive.load(Ordering::Acquire) {
            return Err(broadcast::error::TryRecvError::Closed);
        }
        Ok(event)
    }
}

enum HandshakeError {
    /// The server refused us. Retrying with the same token is pointless.
    Rejected(String),
    /// The connection died before the handshake finished.
    Lost(String),
}

async fn run_session(
    connector: Arc<dyn Connector>,
    url: String,
    user_id: Uuid,
    token: String,
    events_tx: broadcast::Sender<RealtimeEvent>,
    status_tx: watch::Sender<ChannelStatus>,
    sink: CommandSink,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut conn = match connector.connect(&url, &token).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Gateway connect failed: {}", e);
                sleep_backoff(&mut backoff).await;
                continue;
            }
        };

        match handshake(&mut conn, &token, user_id).await {
            Ok(()) => {}
            Err(HandshakeError::Rejected(reason)) => {
                warn!("Gateway rejected handshake: {}", reason);
                status_tx.send_replace(ChannelStatus::Disconnected);
                return;
            }
            Err(HandshakeError::Lost(reason)) => {
                warn!("Connection lost during handshake: {}", reason);
                sleep_backoff(&mut backoff).await;
                continue;
            }
        }

        // Membership in our own user room is part of every connection; the
        // server routes direct messages and notifications through it.
        if conn
            .commands
            .send(ClientCommand::Join {
                room: Room::user(user_id),
            })
            .await
            .is_err()
        {
            sleep_backoff(&mut backoff).await;
            continue;
        }

        info!("Gateway connected as {}", user_id);
        *sink.lock().expect("sink lock poisoned") = Some(conn.commands.clone());
        status_tx.send_replace(ChannelStatus::Connected);
        backoff = INITIAL_BACKOFF;

        let reason = pump(&mut conn, &events_tx).await;

        *sink.lock().expect("sink lock poisoned") = None;
        status_tx.send_replace(ChannelStatus::Connecting);
        match reason {
            CloseReason::ServerClosed => info!("Gateway closed the connection, reconnecting"),
            CloseReason::Transport(ref e) => warn!("Gateway transport error: {}, reconnecting", e),
        }

        sleep_backoff(&mut backoff).await;
    }
}

async fn handshake(
    conn: &mut Connection,
    token: &str,
    user_id: Uuid,
) -> Result<(), HandshakeError> {
    conn.commands
        .send(ClientCommand::Identify {
            token: token.to_string(),
        })
        .await
        .map_err(|_| HandshakeError::Lost("command channel closed".to_string()))?;

    let ready = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            match conn.frames.recv().await {
                Some(Frame::Event(RealtimeEvent::Ready { user_id })) => return Ok(user_id),
                // Anything buffered ahead of Ready is not ours yet.
                Some(Frame::Event(_)) => continue,
                Some(Frame::Closed(CloseReason::ServerClosed)) => {
                    return Err(HandshakeError::Rejected(
                        "server closed during identify".to_string(),
                    ));
                }
                Some(Frame::Closed(CloseReason::Transport(e))) => {
                    return Err(HandshakeError::Lost(e));
                }
                None => return Err(HandshakeError::Lost("connection dropped".to_string())),
            }
        }
    })
    .await;

    match ready {
        Ok(Ok(ready_user)) if ready_user == user_id => Ok(()),
        Ok(Ok(ready_user)) => Err(HandshakeError::Rejected(format!(
            "ready for unexpected user {}",
            ready_user
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(HandshakeError::Lost("handshake timed out".to_string())),
    }
}

async fn pump(conn: &mut Connection, events_tx: &broadcast::Sender<RealtimeEvent>) -> CloseReason {
    loop {
        match conn.frames.recv().await {
            Some(Frame::Event(event)) => {
                // A send with no subscribers is fine; rooms may be quiet.
                let _ = events_tx.send(event);
            }
            Some(Frame::Closed(reason)) => return reason,
            None => return CloseReason::Transport("connection dropped".to_string()),
        }
    }
}

async fn sleep_backoff(backoff: &mut Duration) {
    let jitter = rand::rng().random_range(0.5..=1.5);
    let wait = backoff.mul_f64(jitter);
    debug!("Reconnecting in {:.1}s", wait.as_secs_f64());
    tokio::time::sleep(wait).await;
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
}
