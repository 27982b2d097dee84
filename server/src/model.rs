use serde::{Deserialize, Serialize};

use crate::flag::MessageFlag;
use crate::message::Message;
use crate::transport::ControlRoutingPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "message")]
    #[serde(rename_all = "camelCase")]
    Message { message: Message },
    #[serde(rename = "messageFlag")]
    #[serde(rename_all = "camelCase")]
    MessageFlag { flag: MessageFlag },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::Message { .. } => "message",
            EventPayload::MessageFlag { .. } => "messageFlag",
        }
    }

    pub fn route(&self) -> ControlRoutingPolicy {
        match self {
            EventPayload::Message { message } => ControlRoutingPolicy::Channel {
                channel_id: message.channel_id,
            },
            EventPayload::MessageFlag { flag } if flag.kind.is_private() => {
                ControlRoutingPolicy::User {
                    user_id: flag.user_id,
                }
            }
            EventPayload::MessageFlag { flag } => ControlRoutingPolicy::Channel {
                channel_id: flag.channel_id,
            },
        }
    }
}
