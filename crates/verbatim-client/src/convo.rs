//! Conversation reconciliation.
//!
//! A [`Conversation`] is a pure state machine over one message sequence.
//! Everything async lives in [`crate::chat`]; this module never does I/O, so
//! the ordering rules (optimistic append, in-place confirmation, dedup) are
//! testable without a server.

use tracing::debug;
use uuid::Uuid;

use verbatim_types::models::{Attachment, ChatMessage, ConversationKey, MessageId};

/// An outgoing message before the server has seen it. The attachment URL is
/// unknown until the upload finishes, so only the name travels here.
#[derive(Debug, Clone)]
pub struct Draft {
    pub receiver_id: Uuid,
    pub job_id: Option<Uuid>,
    pub body: String,
    pub attachment_name: Option<String>,
}

/// What reconciling one incoming message did to the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Not this conversation's traffic; sequence untouched.
    Foreign,
    /// Same server id already present; sequence untouched.
    Duplicate,
    /// An optimistic entry was confirmed in place at `index`.
    Confirmed { index: usize },
    /// New confirmed entry appended at the end.
    Appended,
}

pub struct Conversation {
    key: ConversationKey,
    local_user: Uuid,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(key: ConversationKey, local_user: Uuid) -> Self {
        Self {
            key,
            local_user,
            messages: Vec::new(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn local_user(&self) -> Uuid {
        self.local_user
    }

    /// The ordered sequence. Rendering order is append/confirm order; there
    /// is no timestamp sort.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Replace the sequence with fetched history. Entries are forced
    /// non-pending regardless of what the transport delivered.
    pub fn load_history(&mut self, mut history: Vec<ChatMessage>) {
        for msg in &mut history {
            msg.pending = false;
        }
        self.messages = history;
    }

    /// Append an optimistic entry and hand back its temporary id.
    pub fn append_local(&mut self, draft: Draft) -> MessageId {
        let id = MessageId::fresh_local();
        self.messages.push(ChatMessage {
            id: id.clone(),
            sender_id: self.local_user,
            receiver_id: draft.receiver_id,
            job_id: draft.job_id,
            body: draft.body,
            // Placeholder record; confirmation adopts the server's full
            // attachment including the storage URL.
            attachment: draft.attachment_name.map(|name| Attachment {
                url: String::new(),
                name,
            }),
            sent_at: chrono::Utc::now(),
            pending: true,
        });
        id
    }

    /// Fold one confirmed message into the sequence.
    ///
    /// Order of checks: relevance, duplicate id, optimistic confirmation,
    /// plain append. Confirmation replaces the *first* matching pending
    /// entry in place, so repeated identical sends resolve FIFO to distinct
    /// entries.
    pub fn reconcile(&mut self, incoming: ChatMessage) -> Reconciled {
        if !self.key.admits(&incoming) {
            return Reconciled::Foreign;
        }

        if self
            .messages
            .iter()
            .any(|m| !m.pending && m.id == incoming.id)
        {
            debug!("Dropping duplicate message {}", incoming.id);
            return Reconciled::Duplicate;
        }

        let matching = self.messages.iter().position(|m| {
            m.pending
                && m.sender_id == incoming.sender_id
                && m.receiver_id == incoming.receiver_id
                && m.body == incoming.body
                && attachment_name(m) == attachment_name(&incoming)
        });

        let mut confirmed = incoming;
        confirmed.pending = false;

        match matching {
            Some(index) => {
                self.messages[index] = confirmed;
                Reconciled::Confirmed { index }
            }
            None => {
                self.messages.push(confirmed);
                Reconciled::Appended
            }
        }
    }

    /// Roll back an optimistic entry after a failed send. Returns whether
    /// anything was removed; confirmed entries are never touched.
    pub fn remove_local(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| !(m.pending && m.id == *id));
        self.messages.len() != before
    }
}

fn attachment_name(msg: &ChatMessage) -> Option<&str> {
    msg.attachment.as_ref().map(|a| a.name.as_str())
}
