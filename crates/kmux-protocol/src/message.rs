//! Kernel wire messages as they travel over the multiplexed channel.
//!
//! Payload encoding belongs to the transport; this module only models the
//! decoded shape and the few fields the correlator needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ids::MsgId;

/// Logical message stream multiplexed over one kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
}

impl Channel {
    /// Channel a request of `msg_type` is sent on.
    pub fn for_request(msg_type: &str) -> Self {
        match msg_type {
            "input_reply" | "input_request" => Self::Stdin,
            _ => Self::Shell,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Iopub => "iopub",
            Self::Stdin => "stdin",
            Self::Control => "control",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: MsgId,
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// Header of the message being replied to. Empty for unsolicited messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<MsgId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub channel: Channel,
    pub msg_type: String,
    pub header: Header,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn new(channel: Channel, msg_type: impl Into<String>, content: Value) -> Self {
        let msg_type = msg_type.into();
        Self {
            channel,
            header: Header {
                msg_id: MsgId::new_uuid(),
                msg_type: msg_type.clone(),
                session: None,
                date: Some(Utc::now()),
            },
            msg_type,
            parent_header: ParentHeader::default(),
            metadata: Value::Object(Default::default()),
            content,
        }
    }

    /// Marks this message as a reply to `parent`.
    pub fn in_reply_to(mut self, parent: &MsgId) -> Self {
        self.parent_header.msg_id = Some(parent.clone());
        self
    }

    pub fn parent_id(&self) -> Option<&MsgId> {
        self.parent_header.msg_id.as_ref()
    }

    /// `content.execution_state` of a `status` message.
    pub fn execution_state(&self) -> Option<&str> {
        if self.msg_type != "status" {
            return None;
        }
        self.content.get("execution_state").and_then(Value::as_str)
    }

    /// True when the kernel reports it went back to idle.
    pub fn is_status_idle(&self) -> bool {
        self.execution_state() == Some("idle")
    }
}
