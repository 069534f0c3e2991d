use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marketplace roles. The backend stores these lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Transcriber,
    Trainee,
    Admin,
}

/// Transcriber onboarding progress. A transcriber may not take jobs until
/// the assessment is `Passed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentState {
    NotStarted,
    Submitted,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
    /// Only present for transcribers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<AssessmentState>,
    /// Only present for trainees: whether the training fee has been paid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_paid: Option<bool>,
}

/// The authenticated identity. Serialized as JSON into the local store;
/// re-read from there on every startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user: UserProfile,
    pub token: String,
}

/// A message id. Server-assigned ids are opaque strings; ids minted locally
/// for an optimistic send carry a `local-` prefix until the server-confirmed
/// counterpart replaces them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

const LOCAL_PREFIX: &str = "local-";

impl MessageId {
    /// Mint a fresh temporary id for an optimistic message.
    pub fn fresh_local() -> Self {
        Self(format!("{LOCAL_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Opaque storage URL, assigned by the upload service.
    pub url: String,
    pub name: String,
}

/// One unit of chat communication.
///
/// `pending` is a client-only flag marking an optimistic entry that has not
/// yet been confirmed by the server; it never crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    /// Set when the message belongs to a job-scoped thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// May be empty when an attachment is present.
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub sent_at: DateTime<Utc>,
    #[serde(skip)]
    pub pending: bool,
}

/// Identifies one chat scope: a direct user pair, or a job thread.
///
/// Determines which incoming realtime traffic is relevant to an open
/// conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKey {
    /// Unordered pair of participants. Admits only un-scoped messages;
    /// job-thread traffic between the same two users stays in its thread.
    Direct { a: Uuid, b: Uuid },
    /// All messages carrying this job id, regardless of direction.
    Job { job_id: Uuid },
}

impl ConversationKey {
    pub fn direct(a: Uuid, b: Uuid) -> Self {
        Self::Direct { a, b }
    }

    pub fn job(job_id: Uuid) -> Self {
        Self::Job { job_id }
    }

    /// The job scope, when there is one.
    pub fn job_id(&self) -> Option<Uuid> {
        match *self {
            Self::Direct { .. } => None,
            Self::Job { job_id } => Some(job_id),
        }
    }

    /// For a direct conversation, the participant that isn't `local`.
    pub fn peer_of(&self, local: Uuid) -> Option<Uuid> {
        match *self {
            Self::Direct { a, b } if a == local => Some(b),
            Self::Direct { a, b } if b == local => Some(a),
            _ => None,
        }
    }

    /// Relevance predicate: does `msg` belong to this conversation?
    pub fn admits(&self, msg: &ChatMessage) -> bool {
        match *self {
            Self::Direct { a, b } => {
                msg.job_id.is_none()
                    && ((msg.sender_id == a && msg.receiver_id == b)
                        || (msg.sender_id == b && msg.receiver_id == a))
            }
            Self::Job { job_id } => msg.job_id == Some(job_id),
        }
    }
}
