//! Inbound events from a channel: delivered to the gateway for routing.

use crate::routing::ConversationKey;

/// A user message from a channel, to be routed to the conversation's backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel_id: String,
    pub conversation_id: String,
    pub text: String,
    /// Display name of the sender, when the channel provides one.
    pub sender: Option<String>,
}

/// Something a channel wants the gateway to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    /// Users (other than the bot) joined the conversation; they get the welcome text.
    MembersAdded {
        channel_id: String,
        conversation_id: String,
    },
}

impl InboundEvent {
    pub fn key(&self) -> ConversationKey {
        match self {
            InboundEvent::Message(m) => ConversationKey::new(&m.channel_id, &m.conversation_id),
            InboundEvent::MembersAdded {
                channel_id,
                conversation_id,
            } => ConversationKey::new(channel_id, conversation_id),
        }
    }
}
