//! Bot Framework activity payloads (the subset Ferry reads and writes).

use crate::channels::inbound::{InboundEvent, InboundMessage};
use serde::{Deserialize, Serialize};

/// Channel id used when an activity does not carry one.
pub const DEFAULT_CHANNEL_ID: &str = "msteams";

/// An activity as POSTed to /api/messages or sent to the connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_added: Vec<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl Activity {
    pub fn channel_id(&self) -> &str {
        self.channel_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CHANNEL_ID)
    }

    /// Turn the activity into a gateway event. Activities without a conversation, message
    /// activities without text, and conversation updates that only add the bot yield None.
    pub fn to_event(&self) -> Option<InboundEvent> {
        let conversation = self.conversation.as_ref()?;
        match self.typ.as_str() {
            "message" => {
                let text = self.text.as_deref()?;
                Some(InboundEvent::Message(InboundMessage {
                    channel_id: self.channel_id().to_string(),
                    conversation_id: conversation.id.clone(),
                    text: text.to_string(),
                    sender: self.from.as_ref().and_then(|f| f.name.clone()),
                }))
            }
            "conversationUpdate" => {
                let bot_id = self.recipient.as_ref().map(|r| r.id.as_str());
                let humans_joined = self
                    .members_added
                    .iter()
                    .any(|m| Some(m.id.as_str()) != bot_id);
                humans_joined.then(|| InboundEvent::MembersAdded {
                    channel_id: self.channel_id().to_string(),
                    conversation_id: conversation.id.clone(),
                })
            }
            _ => None,
        }
    }
}
