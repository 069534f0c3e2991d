use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Attachment, ChatMessage, MessageId};

/// A gateway room: the unit of event scoping. Every user has their own room,
/// joined automatically on connect; job threads have one room each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Room(pub String);

impl Room {
    pub fn user(id: Uuid) -> Self {
        Self(format!("user:{id}"))
    }

    pub fn job(id: Uuid) -> Self {
        Self(format!("job:{id}"))
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events sent from the gateway to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// Handshake accepted; the connection is live for this user.
    Ready { user_id: Uuid },

    /// A message was committed server-side (echo of our own send, or a
    /// counterpart's message routed to one of our rooms).
    MessageCreate {
        id: MessageId,
        sender_id: Uuid,
        receiver_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<Uuid>,
        #[serde(default)]
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment_name: Option<String>,
        sent_at: DateTime<Utc>,
    },

    /// A client published a new job listing.
    JobPosted { job_id: Uuid, client_id: Uuid },

    /// A transcriber took a listing.
    JobAssigned { job_id: Uuid, transcriber_id: Uuid },

    /// A job was delivered and accepted.
    JobCompleted { job_id: Uuid },

    /// A listing was withdrawn.
    JobCancelled { job_id: Uuid },

    /// A payout was issued to a transcriber.
    PayoutSent {
        payout_id: Uuid,
        transcriber_id: Uuid,
        amount_cents: i64,
    },
}

impl RealtimeEvent {
    /// Extract the confirmed message from a `MessageCreate`, if that is what
    /// this event is. History entries and realtime entries share one shape.
    pub fn into_message(self) -> Option<ChatMessage> {
        match self {
            Self::MessageCreate {
                id,
                sender_id,
                receiver_id,
                job_id,
                body,
                attachment_url,
                attachment_name,
                sent_at,
            } => Some(ChatMessage {
                id,
                sender_id,
                receiver_id,
                job_id,
                body,
                attachment: match (attachment_url, attachment_name) {
                    (Some(url), Some(name)) => Some(Attachment { url, name }),
                    _ => None,
                },
                sent_at,
                pending: false,
            }),
            _ => None,
        }
    }
}

/// Commands sent from the client to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Authenticate the connection. Must be the first frame sent.
    Identify { token: String },

    /// Subscribe to a room's events.
    Join { room: Room },

    /// Unsubscribe from a room.
    Leave { room: Room },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_tagged_wire_shape() {
        let ev = RealtimeEvent::JobPosted {
            job_id: Uuid::nil(),
            client_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "job_posted");
        assert!(json["data"]["job_id"].is_string());
    }

    #[test]
    fn message_create_round_trips_into_chat_message() {
        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();
        let ev = RealtimeEvent::MessageCreate {
            id: MessageId::from("m42"),
            sender_id: sender,
            receiver_id: receiver,
            job_id: None,
            body: "done, uploading now".into(),
            attachment_url: Some("https://files.example/abc".into()),
            attachment_name: Some("interview.flac".into()),
            sent_at: Utc::now(),
        };

        let msg = ev.into_message().unwrap();
        assert_eq!(msg.id, MessageId::from("m42"));
        assert_eq!(msg.attachment.as_ref().unwrap().name, "interview.flac");
        assert!(!msg.pending);
    }

    #[test]
    fn identify_command_shape_matches_gateway_contract() {
        let cmd = ClientCommand::Identify {
            token: "tok".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "identify");
        assert_eq!(json["data"]["token"], "tok");
    }

    #[test]
    fn room_names_are_stable() {
        let id = Uuid::nil();
        assert_eq!(Room::user(id).0, format!("user:{id}"));
        assert_eq!(Room::job(id).0, format!("job:{id}"));
    }
}
