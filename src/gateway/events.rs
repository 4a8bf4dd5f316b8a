//! Gateway payload parsing.
//!
//! Raw frames become [`GatewayPayload`]s (opcode + sequence + type), and
//! dispatch payloads decode into the [`DispatchEvent`]s the account runtime
//! consumes. Decoding is total: unknown event types map to `Ok(None)` and
//! malformed payloads surface as an explicit error, never a panic.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::task::Button;

// Gateway opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// Close/failure code used internally to request a resume.
pub const CLOSE_CODE_RECONNECT: u16 = 2001;
/// Close code hinting the server to keep the session alive for a resume.
pub const CLOSE_CODE_RESUME_HINT: u16 = 4000;
/// Close code marking an internal exception; forces a fresh session.
pub const CLOSE_CODE_EXCEPTION: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GatewayCommand {
    pub op: u8,
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct ReadyData {
    session_id: String,
    resume_gateway_url: String,
    #[serde(default)]
    user: ReadyUser,
}

#[derive(Debug, Default, Deserialize)]
struct ReadyUser {
    #[serde(default)]
    id: String,
}

/// Discord sends nonces as either strings or integers.
fn de_nonce<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireEmoji {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
    pub description: String,
    pub default: bool,
}

/// A message component row, button or select menu as it appears on the wire.
/// Also cached on accounts as the last-seen settings controls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireComponent {
    #[serde(rename = "type")]
    pub kind: i32,
    pub custom_id: String,
    pub label: String,
    pub style: i32,
    pub emoji: Option<WireEmoji>,
    pub components: Vec<WireComponent>,
    pub options: Vec<SelectOption>,
}

impl WireComponent {
    /// Flatten action rows into the button list a task stores.
    pub fn flatten_buttons(rows: &[WireComponent]) -> Vec<Button> {
        let mut buttons = Vec::new();
        for row in rows {
            for component in &row.components {
                if component.kind == 2 {
                    buttons.push(Button {
                        custom_id: component.custom_id.clone(),
                        label: component.label.clone(),
                        emoji: component
                            .emoji
                            .as_ref()
                            .map(|e| e.name.clone())
                            .unwrap_or_default(),
                        style: component.style,
                        kind: component.kind,
                    });
                }
            }
        }
        buttons
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub url: String,
    pub proxy_url: String,
    pub filename: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Embed {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageAuthor {
    pub id: String,
    pub username: String,
    pub bot: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InteractionMetadata {
    pub id: String,
    pub name: String,
}

/// The message fields the runtime correlates and reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageData {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub content: String,
    #[serde(deserialize_with = "de_nonce")]
    pub nonce: String,
    pub author: Option<MessageAuthor>,
    pub interaction_metadata: Option<InteractionMetadata>,
    /// Older field carrying the originating interaction; some events set only
    /// one of the two.
    pub interaction: Option<InteractionMetadata>,
    pub attachments: Vec<Attachment>,
    pub components: Vec<WireComponent>,
    pub embeds: Vec<Embed>,
    pub flags: Option<u64>,
}

impl MessageData {
    /// The interaction id this message answers, whichever field carries it.
    pub fn interaction_id(&self) -> Option<&str> {
        self.interaction_metadata
            .as_ref()
            .or(self.interaction.as_ref())
            .map(|m| m.id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Name of the slash command this message answers ("settings", "info").
    pub fn interaction_name(&self) -> Option<&str> {
        self.interaction_metadata
            .as_ref()
            .or(self.interaction.as_ref())
            .map(|m| m.name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn first_attachment_url(&self) -> Option<&str> {
        self.attachments
            .first()
            .map(|a| a.url.as_str())
            .filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct InteractionData {
    id: String,
    #[serde(deserialize_with = "de_nonce")]
    nonce: String,
    custom_id: String,
}

/// A decoded dispatch event delivered to the account runtime.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Ready {
        session_id: String,
        resume_gateway_url: String,
        user_id: String,
    },
    Resumed,
    InteractionCreate {
        id: String,
        nonce: String,
    },
    InteractionSuccess {
        id: String,
        nonce: String,
    },
    InteractionFailure {
        id: String,
        nonce: String,
    },
    InteractionModalCreate {
        id: String,
        nonce: String,
        custom_id: String,
    },
    MessageCreate(MessageData),
    MessageUpdate(MessageData),
    MessageDelete {
        id: String,
        channel_id: String,
    },
}

impl DispatchEvent {
    /// Decode a dispatch payload. Unknown event types are not an error; they
    /// decode to `None` and are dropped by the caller.
    pub fn decode(event_type: &str, data: Value) -> Result<Option<DispatchEvent>, serde_json::Error> {
        let event = match event_type {
            "READY" => {
                let ready: ReadyData = serde_json::from_value(data)?;
                Some(DispatchEvent::Ready {
                    session_id: ready.session_id,
                    resume_gateway_url: ready.resume_gateway_url,
                    user_id: ready.user.id,
                })
            }
            "RESUMED" => Some(DispatchEvent::Resumed),
            "INTERACTION_CREATE" => {
                let d: InteractionData = serde_json::from_value(data)?;
                Some(DispatchEvent::InteractionCreate {
                    id: d.id,
                    nonce: d.nonce,
                })
            }
            "INTERACTION_SUCCESS" => {
                let d: InteractionData = serde_json::from_value(data)?;
                Some(DispatchEvent::InteractionSuccess {
                    id: d.id,
                    nonce: d.nonce,
                })
            }
            "INTERACTION_FAILURE" => {
                let d: InteractionData = serde_json::from_value(data)?;
                Some(DispatchEvent::InteractionFailure {
                    id: d.id,
                    nonce: d.nonce,
                })
            }
            "INTERACTION_MODAL_CREATE" | "INTERACTION_IFRAME_MODAL_CREATE" => {
                let d: InteractionData = serde_json::from_value(data)?;
                Some(DispatchEvent::InteractionModalCreate {
                    id: d.id,
                    nonce: d.nonce,
                    custom_id: d.custom_id,
                })
            }
            "MESSAGE_CREATE" => {
                let d: MessageData = serde_json::from_value(data)?;
                Some(DispatchEvent::MessageCreate(d))
            }
            "MESSAGE_UPDATE" => {
                let d: MessageData = serde_json::from_value(data)?;
                Some(DispatchEvent::MessageUpdate(d))
            }
            "MESSAGE_DELETE" => {
                let d: MessageData = serde_json::from_value(data)?;
                Some(DispatchEvent::MessageDelete {
                    id: d.id,
                    channel_id: d.channel_id,
                })
            }
            _ => None,
        };
        Ok(event)
    }

    /// Channel the event belongs to, when it carries one.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::MessageCreate(m) | DispatchEvent::MessageUpdate(m) => {
                Some(m.channel_id.as_str())
            }
            DispatchEvent::MessageDelete { channel_id, .. } => Some(channel_id.as_str()),
            _ => None,
        }
    }
}
