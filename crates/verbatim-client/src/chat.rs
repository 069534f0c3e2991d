//! Conversation controller: optimistic sending plus live reconciliation.
//!
//! One controller per open conversation view. It owns a [`Conversation`],
//! feeds it from the realtime channel and from send confirmations, and
//! exposes an immutable snapshot plus a revision counter for rendering.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use verbatim_api::ApiClient;
use verbatim_channel::{ChannelHandle, ChannelStatus, EventSubscription};
use verbatim_types::api::SendMessageRequest;
use verbatim_types::events::Room;
use verbatim_types::models::{Attachment, ChatMessage, ConversationKey};

use crate::convo::{Conversation, Draft, Reconciled};
use crate::error::ClientError;

/// Upload cap, enforced before any bytes leave the machine.
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

/// Side-effect hooks for an open conversation. `message_received` fires for
/// messages that arrive from the other party; confirmations of our own
/// sends and duplicate deliveries never reach it. `send_failed` fires after
/// a failed send's optimistic entry has been rolled back.
pub trait Notifier: Send + Sync + 'static {
    fn message_received(&self, message: &ChatMessage);
    fn send_failed(&self, error: &ClientError);
}

/// Drops every notification; for views that are already focused.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn message_received(&self, _message: &ChatMessage) {}
    fn send_failed(&self, _error: &ClientError) {}
}

pub struct OutgoingAttachment {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub struct Outgoing {
    pub to: Uuid,
    pub body: String,
    pub attachment: Option<OutgoingAttachment>,
}

struct ChatShared {
    key: ConversationKey,
    local_user: Uuid,
    api: Arc<ApiClient>,
    handle: ChannelHandle,
    notifier: Arc<dyn Notifier>,
    state: Mutex<Conversation>,
    revision: watch::Sender<u64>,
}

impl ChatShared {
    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Conversation> {
        self.state.lock().expect("conversation lock poisoned")
    }

    /// Route one incoming message through the reducer and fire the
    /// notifier for genuinely new traffic from the other party.
    fn apply_incoming(&self, message: ChatMessage) {
        let outcome = self.lock().reconcile(message.clone());
        match outcome {
            Reconciled::Appended => {
                self.bump();
                if message.sender_id != self.local_user {
                    self.notifier.message_received(&message);
                }
            }
            Reconciled::Confirmed { .. } => self.bump(),
            Reconciled::Duplicate | Reconciled::Foreign => {}
        }
    }

    async fn fetch_history(&self) -> Result<Vec<ChatMessage>, ClientError> {
        let history = match self.key {
            ConversationKey::Job { job_id } => self.api.job_history(job_id).await?,
            ConversationKey::Direct { .. } => {
                let peer = self
                    .key
                    .peer_of(self.local_user)
                    .ok_or(ClientError::NotParticipant)?;
                self.api.direct_history(peer).await?
            }
        };
        Ok(history)
    }

    async fn refresh_history(&self) {
        match self.fetch_history().await {
            Ok(history) => {
                self.lock().load_history(history);
                self.bump();
            }
            Err(e) => warn!("Failed to refresh conversation history: {}", e),
        }
    }

    async fn join_room(&self) {
        if let Some(job_id) = self.key.job_id() {
            // Direct traffic arrives on the per-user room the gateway
            // joins for us; only job conversations need an explicit join.
            if let Err(e) = self.handle.join(Room::job(job_id)).await {
                debug!("Deferring room join until connected: {}", e);
            }
        }
    }

    async fn leave_room(&self) {
        if let Some(job_id) = self.key.job_id() {
            let _ = self.handle.leave(Room::job(job_id)).await;
        }
    }
}

pub struct ChatController {
    shared: Arc<ChatShared>,
    pump: JoinHandle<()>,
}

impl ChatController {
    /// Open a conversation: subscribe to the channel, join the room, pull
    /// history, and start the pump that folds live events into the state.
    ///
    /// Subscription happens before the history fetch so nothing can slip
    /// between the two; any overlap collapses in the reducer.
    pub async fn open(
        key: ConversationKey,
        api: Arc<ApiClient>,
        handle: ChannelHandle,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ClientError> {
        let local_user = handle.user_id();
        let events = handle.events();
        let mut status = handle.status();
        status.mark_unchanged();

        let (revision, _) = watch::channel(0);
        let shared = Arc::new(ChatShared {
            key,
            local_user,
            api,
            handle,
            notifier,
            state: Mutex::new(Conversation::new(key, local_user)),
            revision,
        });

        shared.join_room().await;

        let history = match shared.fetch_history().await {
            Ok(history) => history,
            Err(e) => {
                // No controller exists to close(); give the membership back
                // rather than leaking it for the rest of the session.
                shared.leave_room().await;
                return Err(e);
            }
        };
        shared.lock().load_history(history);
        shared.bump();

        let pump = tokio::spawn(pump(shared.clone(), events, status));
        info!("Opened conversation {:?}", key);

        Ok(Self { shared, pump })
    }

    /// Validate, append optimistically, then perform the upload and send.
    /// On failure the optimistic entry is rolled back and the error is
    /// returned for the composer to surface.
    pub async fn send(&self, outgoing: Outgoing) -> Result<(), ClientError> {
        validate(&outgoing)?;

        let body = outgoing.body.trim().to_string();
        let local_id = self.shared.lock().append_local(Draft {
            receiver_id: outgoing.to,
            job_id: self.shared.key.job_id(),
            body: body.clone(),
            attachment_name: outgoing.attachment.as_ref().map(|a| a.name.clone()),
        });
        self.shared.bump();

        let result = self.deliver(&outgoing, body).await;
        match result {
            Ok(confirmed) => {
                // The gateway echo may have confirmed the entry already;
                // the reducer resolves either order.
                self.shared.apply_incoming(confirmed);
                Ok(())
            }
            Err(e) => {
                warn!("Send failed, rolling back optimistic entry: {}", e);
                if self.shared.lock().remove_local(&local_id) {
                    self.shared.bump();
                }
                self.shared.notifier.send_failed(&e);
                Err(e)
            }
        }
    }

    async fn deliver(&self, outgoing: &Outgoing, body: String) -> Result<ChatMessage, ClientError> {
        let attachment = match &outgoing.attachment {
            Some(att) => {
                let uploaded = self
                    .shared
                    .api
                    .upload_attachment(&att.name, att.bytes.clone())
                    .await?;
                Some(Attachment {
                    url: uploaded.url,
                    name: uploaded.name,
                })
            }
            None => None,
        };

        let confirmed = self
            .shared
            .api
            .send_message(&SendMessageRequest {
                receiver_id: outgoing.to,
                job_id: self.shared.key.job_id(),
                body,
                attachment,
            })
            .await?;
        Ok(confirmed)
    }

    /// Current message sequence, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.shared.lock().messages().to_vec()
    }

    /// Bumped on every visible mutation; views watch this to re-render.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Leave the job room and stop the pump.
    pub async fn close(self) {
        self.shared.leave_room().await;
        self.pump.abort();
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    shared: Arc<ChatShared>,
    mut events: EventSubscription,
    mut status: watch::Receiver<ChannelStatus>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(message) = event.into_message() {
                        shared.apply_incoming(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Conversation fell {} events behind, refetching history", n);
                    shared.refresh_history().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                if *status.borrow_and_update() == ChannelStatus::Connected {
                    // Back online: rejoin and close the gap the outage left.
                    shared.join_room().await;
                    shared.refresh_history().await;
                }
            }
        }
    }
}

fn validate(outgoing: &Outgoing) -> Result<(), ClientError> {
    if outgoing.body.trim().is_empty() && outgoing.attachment.is_none() {
        return Err(ClientError::EmptyMessage);
    }
    if let Some(att) = &outgoing.attachment {
        if att.bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(ClientError::AttachmentTooLarge {
                size: att.bytes.len(),
            });
        }
    }
    Ok(())
}
