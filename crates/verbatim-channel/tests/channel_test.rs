//! Channel manager tests against a scripted in-memory transport.
//!
//! Each `FakeConnector::connect` hands the test a `ServerEnd`: the test plays
//! the gateway, answering Identify with Ready and injecting events or
//! closures to drive the manager through its states.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use uuid::Uuid;

use verbatim_channel::{
    ChannelError, ChannelHandle, ChannelManager, ChannelStatus, CloseReason, Connection,
    Connector, Frame,
};
use verbatim_types::events::{ClientCommand, RealtimeEvent, Room};
use verbatim_types::models::MessageId;

const WAIT: Duration = Duration::from_secs(5);

/// A connection as the server sees it.
struct ServerEnd {
    commands: mpsc::Receiver<ClientCommand>,
    frames: mpsc::Sender<Frame>,
}

struct FakeConnector {
    ends: mpsc::UnboundedSender<ServerEnd>,
    refuse_first: AtomicUsize,
}

impl FakeConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        Self::refusing(0)
    }

    /// Refuse the first `n` connection attempts, then accept.
    fn refusing(n: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends_tx, ends_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ends: ends_tx,
                refuse_first: AtomicUsize::new(n),
            }),
            ends_rx,
        )
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _url: &str, _token: &str) -> BoxFuture<'static, anyhow::Result<Connection>> {
        let refused = self
            .refuse_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let ends = self.ends.clone();

        Box::pin(async move {
            if refused {
                anyhow::bail!("connection refused");
            }
            let (commands_tx, commands_rx) = mpsc::channel(32);
            let (frames_tx, frames_rx) = mpsc::channel(32);
            ends.send(ServerEnd {
                commands: commands_rx,
                frames: frames_tx,
            })
            .map_err(|_| anyhow::anyhow!("test dropped the server side"))?;
            Ok(Connection {
                commands: commands_tx,
                frames: frames_rx,
            })
        })
    }
}

async fn next_server(ends: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    timeout(WAIT, ends.recv())
        .await
        .expect("timed out waiting for a connection attempt")
        .expect("connector dropped")
}

async fn next_command(server: &mut ServerEnd) -> ClientCommand {
    timeout(WAIT, server.commands.recv())
        .await
        .expect("timed out waiting for a command")
        .expect("client hung up")
}

/// Play a gateway accepting the handshake: expect Identify, reply Ready,
/// consume the automatic user-room join. Returns the joined room.
async fn accept(server: &mut ServerEnd, user_id: Uuid) -> Room {
    match next_command(server).await {
        ClientCommand::Identify { token } => assert!(!token.is_empty()),
        other => panic!("expected identify, got {:?}", other),
    }
    server
        .frames
        .send(Frame::Event(RealtimeEvent::Ready { user_id }))
        .await
        .unwrap();
    match next_command(server).await {
        ClientCommand::Join { room } => room,
        other => panic!("expected join, got {:?}", other),
    }
}

async fn wait_status(handle: &ChannelHandle, want: ChannelStatus) {
    let mut status = handle.status();
    timeout(WAIT, status.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for status change")
        .expect("status sender dropped");
}

async fn assert_no_connect(ends: &mut mpsc::UnboundedReceiver<ServerEnd>, window: Duration) {
    if let Ok(Some(_)) = timeout(window, ends.recv()).await {
        panic!("unexpected connection attempt");
    }
}

fn message_event(sender_id: Uuid, receiver_id: Uuid, body: &str) -> RealtimeEvent {
    RealtimeEvent::MessageCreate {
        id: MessageId::from("m1"),
        sender_id,
        receiver_id,
        job_id: None,
        body: body.to_string(),
        attachment_url: None,
        attachment_name: None,
        sent_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn connect_is_idempotent_for_same_user() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let first = manager.connect(user, "tok");
    let mut server = next_server(&mut ends).await;
    let joined = accept(&mut server, user).await;
    assert_eq!(joined, Room::user(user));
    wait_status(&first, ChannelStatus::Connected).await;

    // Same identity: no second physical connection, shared fan-out.
    let second = manager.connect(user, "tok");
    let mut events_first = first.events();
    let mut events_second = second.events();

    server
        .frames
        .send(Frame::Event(message_event(peer, user, "hello")))
        .await
        .unwrap();

    for events in [&mut events_first, &mut events_second] {
        let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(ev, RealtimeEvent::MessageCreate { .. }));
    }
    assert_no_connect(&mut ends, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn identity_switch_tears_down_old_session() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let alice_handle = manager.connect(alice, "tok-alice");
    let mut alice_server = next_server(&mut ends).await;
    accept(&mut alice_server, alice).await;
    wait_status(&alice_handle, ChannelStatus::Connected).await;
    let mut alice_events = alice_handle.events();

    let bob_handle = manager.connect(bob, "tok-bob");
    let mut bob_server = next_server(&mut ends).await;
    let joined = accept(&mut bob_server, bob).await;
    assert_eq!(joined, Room::user(bob));
    wait_status(&bob_handle, ChannelStatus::Connected).await;

    // Everything subscribed under the old identity observes closure; no
    // event for the new identity can ever reach it.
    let closed = timeout(WAIT, async {
        loop {
            match alice_events.recv().await {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Ok(ev) => panic!("stale subscriber saw {:?}", ev),
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old subscription never closed");
}

#[tokio::test]
async fn identity_switch_discards_events_buffered_before_it() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let alice_handle = manager.connect(alice, "tok-alice");
    let mut alice_server = next_server(&mut ends).await;
    accept(&mut alice_server, alice).await;
    wait_status(&alice_handle, ChannelStatus::Connected).await;

    // Two subscriptions see the same event; only one drains it, so the
    // other still holds it buffered when the identity switches.
    let mut sibling = alice_handle.events();
    let mut stale = alice_handle.events();
    alice_server
        .frames
        .send(Frame::Event(message_event(peer, alice, "for alice")))
        .await
        .unwrap();
    let ev = timeout(WAIT, sibling.recv()).await.unwrap().unwrap();
    assert!(matches!(ev, RealtimeEvent::MessageCreate { .. }));

    let bob_handle = manager.connect(bob, "tok-bob");
    let mut bob_server = next_server(&mut ends).await;
    accept(&mut bob_server, bob).await;
    wait_status(&bob_handle, ChannelStatus::Connected).await;

    // The buffered event must not surface now; the subscription is dead.
    match timeout(WAIT, stale.recv()).await.expect("recv never resolved") {
        Err(broadcast::error::RecvError::Closed) => {}
        other => panic!("stale subscription yielded {:?} after the switch", other),
    }
}

#[tokio::test]
async fn reconnects_and_rejoins_after_server_drop() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let handle = manager.connect(user, "tok");
    let mut server = next_server(&mut ends).await;
    accept(&mut server, user).await;
    wait_status(&handle, ChannelStatus::Connected).await;

    // Subscription taken before the outage keeps working after it.
    let mut events = handle.events();

    server
        .frames
        .send(Frame::Closed(CloseReason::Transport("reset by peer".into())))
        .await
        .unwrap();
    wait_status(&handle, ChannelStatus::Connecting).await;

    // The manager comes back on its own: identify again, rejoin the user room.
    let mut server = next_server(&mut ends).await;
    let rejoined = accept(&mut server, user).await;
    assert_eq!(rejoined, Room::user(user));
    wait_status(&handle, ChannelStatus::Connected).await;

    server
        .frames
        .send(Frame::Event(message_event(peer, user, "still there?")))
        .await
        .unwrap();
    let ev = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(ev, RealtimeEvent::MessageCreate { .. }));
}

#[tokio::test]
async fn manual_disconnect_never_reconnects() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();

    let handle = manager.connect(user, "tok");
    let mut server = next_server(&mut ends).await;
    accept(&mut server, user).await;
    wait_status(&handle, ChannelStatus::Connected).await;

    manager.disconnect();
    wait_status(&handle, ChannelStatus::Disconnected).await;

    // Long enough to cover the first backoff window had one been scheduled.
    assert_no_connect(&mut ends, Duration::from_millis(2500)).await;

    // Disconnecting again is a no-op.
    manager.disconnect();
}

#[tokio::test]
async fn refused_identify_halts_the_session() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();

    let handle = manager.connect(user, "expired-tok");
    let mut server = next_server(&mut ends).await;

    match next_command(&mut server).await {
        ClientCommand::Identify { .. } => {}
        other => panic!("expected identify, got {:?}", other),
    }
    // The gateway drops unauthenticated sockets instead of answering.
    server
        .frames
        .send(Frame::Closed(CloseReason::ServerClosed))
        .await
        .unwrap();

    wait_status(&handle, ChannelStatus::Disconnected).await;
    assert_no_connect(&mut ends, Duration::from_millis(2500)).await;
}

#[tokio::test]
async fn ready_for_wrong_user_halts_the_session() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();

    let handle = manager.connect(user, "tok");
    let mut server = next_server(&mut ends).await;

    match next_command(&mut server).await {
        ClientCommand::Identify { .. } => {}
        other => panic!("expected identify, got {:?}", other),
    }
    server
        .frames
        .send(Frame::Event(RealtimeEvent::Ready {
            user_id: Uuid::new_v4(),
        }))
        .await
        .unwrap();

    wait_status(&handle, ChannelStatus::Disconnected).await;
    assert_no_connect(&mut ends, Duration::from_millis(2500)).await;
}

#[tokio::test]
async fn transport_failures_retry_until_accepted() {
    let (connector, mut ends) = FakeConnector::refusing(2);
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();

    let handle = manager.connect(user, "tok");

    // Two refusals, then the third attempt lands (1s + 2s backoff, jittered).
    let mut server = timeout(Duration::from_secs(15), ends.recv())
        .await
        .expect("never retried after refused connects")
        .expect("connector dropped");
    accept(&mut server, user).await;
    wait_status(&handle, ChannelStatus::Connected).await;
}

#[tokio::test]
async fn join_and_leave_reach_the_server_when_connected() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();
    let job = Uuid::new_v4();

    let handle = manager.connect(user, "tok");
    let mut server = next_server(&mut ends).await;
    accept(&mut server, user).await;
    wait_status(&handle, ChannelStatus::Connected).await;

    handle.join(Room::job(job)).await.unwrap();
    match next_command(&mut server).await {
        ClientCommand::Join { room } => assert_eq!(room, Room::job(job)),
        other => panic!("expected join, got {:?}", other),
    }

    handle.leave(Room::job(job)).await.unwrap();
    match next_command(&mut server).await {
        ClientCommand::Leave { room } => assert_eq!(room, Room::job(job)),
        other => panic!("expected leave, got {:?}", other),
    }
}

#[tokio::test]
async fn join_fails_before_the_handshake_finishes() {
    let (connector, mut ends) = FakeConnector::new();
    let manager = ChannelManager::new("ws://test", connector);
    let user = Uuid::new_v4();

    let handle = manager.connect(user, "tok");
    // The server end exists but the test never answers Identify.
    let _server = next_server(&mut ends).await;

    let err = handle.join(Room::job(Uuid::new_v4())).await.unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected));
}
