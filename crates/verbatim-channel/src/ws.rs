use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use verbatim_types::events::{ClientCommand, RealtimeEvent};

use crate::connector::{CloseReason, Connection, Connector, Frame};

/// Production transport: JSON text frames over a WebSocket.
///
/// The token rides the upgrade URL so the server can authenticate at the
/// HTTP layer; the manager still identifies in-band afterwards.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str, token: &str) -> futures_util::future::BoxFuture<'static, anyhow::Result<Connection>> {
        let ws_url = format!("{}?token={}", url, token);

        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
            let (mut sink, mut stream) = ws_stream.split();

            let (commands_tx, mut commands_rx) = mpsc::channel::<ClientCommand>(32);
            let (frames_tx, frames_rx) = mpsc::channel::<Frame>(256);

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        cmd = commands_rx.recv() => {
                            // None: the manager dropped this connection.
                            let Some(cmd) = cmd else { break };
                            let text = match serde_json::to_string(&cmd) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("Failed to encode gateway command: {}", e);
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match serde_json::from_str::<RealtimeEvent>(&text) {
                                        Ok(event) => {
                                            if frames_tx.send(Frame::Event(event)).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            let preview: String = text.chars().take(200).collect();
                                            warn!("Bad gateway event: {} -- raw: {}", e, preview);
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    if sink.send(Message::Pong(payload)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    let _ = frames_tx
                                        .send(Frame::Closed(CloseReason::ServerClosed))
                                        .await;
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    let _ = frames_tx
                                        .send(Frame::Closed(CloseReason::Transport(e.to_string())))
                                        .await;
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            Ok(Connection {
                commands: commands_tx,
                frames: frames_rx,
            })
        })
    }
}
