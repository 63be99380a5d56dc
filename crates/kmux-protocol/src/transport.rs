//! Commands sent to, and events received from, a multiplexing transport.
//!
//! Both travel as internally tagged JSON objects so a transport process can
//! exchange them as JSON lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::ids::{KernelId, MsgId};
use crate::message::{Channel, KernelMessage};

/// Identity of a remote endpoint: its HTTP base URL and websocket URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub base_url: String,
    pub ws_url: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ws_url: ws_url.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.base_url, self.ws_url)
    }
}

/// Everything a transport needs to open per-kernel sockets for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Capacity of the event channel handed back by the launcher.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_event_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Directive {
    Send {
        channel: Channel,
        msg_type: String,
        content: Value,
        msg_id: MsgId,
    },
    ConnectChannels,
    DisconnectChannels,
}

impl Directive {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::ConnectChannels => "connect-channels",
            Self::DisconnectChannels => "disconnect-channels",
        }
    }
}

/// A directive addressed to one kernel of the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportCommand {
    pub kernel_id: KernelId,
    #[serde(flatten)]
    pub directive: Directive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportEventKind {
    ConnectChannels,
    DisconnectChannels,
    Message { message: KernelMessage },
    /// A socket frame that was neither text nor binary, or a socket failure.
    Error { status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    pub kernel_id: KernelId,
    #[serde(flatten)]
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(kernel_id: KernelId, kind: TransportEventKind) -> Self {
        Self { kernel_id, kind }
    }

    pub fn message(kernel_id: KernelId, message: KernelMessage) -> Self {
        Self::new(kernel_id, TransportEventKind::Message { message })
    }
}

/// An event forwarded to a comm filter, with the kernel id stripped.
#[derive(Debug, Clone, PartialEq)]
pub enum CommEvent {
    Message(KernelMessage),
    Error { status: u16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_serializes_flat_with_kernel_id() {
        let command = TransportCommand {
            kernel_id: KernelId::from("k1"),
            directive: Directive::ConnectChannels,
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value, json!({ "kernel_id": "k1", "type": "connect-channels" }));
    }

    #[test]
    fn send_command_carries_channel_and_msg_id() {
        let command = TransportCommand {
            kernel_id: KernelId::from("k1"),
            directive: Directive::Send {
                channel: Channel::Shell,
                msg_type: "execute_request".to_owned(),
                content: json!({ "code": "1 + 1" }),
                msg_id: MsgId::from("m1"),
            },
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["type"], "send");
        assert_eq!(value["channel"], "shell");
        assert_eq!(value["msg_id"], "m1");
    }

    #[test]
    fn event_parses_from_json_line() {
        let line = r#"{"kernel_id":"k2","type":"disconnect-channels"}"#;
        let event: TransportEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.kernel_id.as_str(), "k2");
        assert_eq!(event.kind, TransportEventKind::DisconnectChannels);

        let line = r#"{"kernel_id":"k2","type":"error","status":1003,"reason":"unsupported frame"}"#;
        let event: TransportEvent = serde_json::from_str(line).unwrap();
        assert!(matches!(event.kind, TransportEventKind::Error { status: 1003, .. }));
    }
}
