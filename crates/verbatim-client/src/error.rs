use verbatim_api::ApiError;
use verbatim_channel::ChannelError;

use crate::chat::MAX_ATTACHMENT_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Rejected before any network call.
    #[error("message has no body and no attachment")]
    EmptyMessage,

    /// Rejected before any network call.
    #[error("attachment is {size} bytes, limit is {}", MAX_ATTACHMENT_BYTES)]
    AttachmentTooLarge { size: usize },

    #[error("the signed-in user is not a party to this conversation")]
    NotParticipant,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
