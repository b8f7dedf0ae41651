//! Protocol packet codec.
//!
//! Frames are plain text: `<type>:<id>[+]:<endpoint>[:<data>]`. Empty
//! fields mean "absent". A `+` after the id asks the peer to answer with
//! an ack that carries data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sio_core::error::{SioError, SioResult};

/// Packet type codes of the v1 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Disconnect,
    Connect,
    Heartbeat,
    Message,
    Json,
    Event,
    Ack,
    Error,
    Noop,
}

impl PacketType {
    /// Parse a wire type digit.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnect),
            1 => Some(Self::Connect),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::Message),
            4 => Some(Self::Json),
            5 => Some(Self::Event),
            6 => Some(Self::Ack),
            7 => Some(Self::Error),
            8 => Some(Self::Noop),
            _ => None,
        }
    }

    /// The wire type digit.
    pub fn code(self) -> u8 {
        match self {
            Self::Disconnect => 0,
            Self::Connect => 1,
            Self::Heartbeat => 2,
            Self::Message => 3,
            Self::Json => 4,
            Self::Event => 5,
            Self::Ack => 6,
            Self::Error => 7,
            Self::Noop => 8,
        }
    }

    /// Whether packets of this type carry application data to an endpoint.
    pub fn is_payload(self) -> bool {
        matches!(self, Self::Message | Self::Json | Self::Event)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnect => "disconnect",
            Self::Connect => "connect",
            Self::Heartbeat => "heartbeat",
            Self::Message => "message",
            Self::Json => "json",
            Self::Event => "event",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Noop => "noop",
        };
        f.write_str(name)
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    /// Message id, present when the sender wants an acknowledgement.
    pub id: Option<u64>,
    /// The id carried a `+`: the ack must echo data back.
    pub ack_with_data: bool,
    /// Target endpoint; empty for the root namespace.
    pub endpoint: String,
    pub data: String,
}

impl Packet {
    pub fn new(kind: PacketType, endpoint: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind,
            id: None,
            ack_with_data: false,
            endpoint: endpoint.into(),
            data: data.into(),
        }
    }

    /// Attach a message id that requests a data-carrying acknowledgement.
    pub fn with_ack_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self.ack_with_data = true;
        self
    }

    pub fn heartbeat() -> Self {
        Self::new(PacketType::Heartbeat, "", "")
    }

    pub fn connect(endpoint: &str) -> Self {
        Self::new(PacketType::Connect, endpoint, "")
    }

    pub fn disconnect(endpoint: &str) -> Self {
        Self::new(PacketType::Disconnect, endpoint, "")
    }

    /// An ack answering message `id`, optionally carrying arguments.
    pub fn ack(endpoint: &str, id: u64, args: Option<&[Value]>) -> Self {
        let data = match args {
            Some(args) => format!("{id}+{}", Value::Array(args.to_vec())),
            None => id.to_string(),
        };
        Self::new(PacketType::Ack, endpoint, data)
    }

    /// Encode to the wire text format.
    pub fn encode(&self) -> String {
        let id = match self.id {
            Some(id) if self.ack_with_data => format!("{id}+"),
            Some(id) => id.to_string(),
            None => String::new(),
        };
        if self.data.is_empty() {
            format!("{}:{}:{}", self.kind.code(), id, self.endpoint)
        } else {
            format!("{}:{}:{}:{}", self.kind.code(), id, self.endpoint, self.data)
        }
    }

    /// Decode one wire frame. Missing trailing fields are treated as empty.
    pub fn decode(frame: &str) -> SioResult<Self> {
        let mut fields = frame.splitn(4, ':');
        let type_field = fields.next().unwrap_or_default();
        let id_field = fields.next().unwrap_or_default();
        let endpoint = fields.next().unwrap_or_default();
        let data = fields.next().unwrap_or_default();

        let kind = type_field
            .parse::<u8>()
            .ok()
            .and_then(PacketType::from_code)
            .ok_or_else(|| SioError::Protocol(format!("unknown packet type {type_field:?}")))?;

        let (id_digits, ack_with_data) = match id_field.strip_suffix('+') {
            Some(digits) => (digits, true),
            None => (id_field, false),
        };
        let id = if id_digits.is_empty() {
            None
        } else {
            Some(
                id_digits
                    .parse::<u64>()
                    .map_err(|_| SioError::Protocol(format!("bad message id {id_field:?}")))?,
            )
        };

        Ok(Self {
            kind,
            id,
            ack_with_data: ack_with_data && id.is_some(),
            endpoint: endpoint.to_string(),
            data: data.to_string(),
        })
    }
}

/// Split an inbound ack payload `<ackId>[+<json array>]`.
///
/// Arguments that are absent or not a JSON array decode as empty.
pub fn parse_ack_data(data: &str) -> Option<(u64, Vec<Value>)> {
    let (id, args) = match data.split_once('+') {
        Some((id, args)) => (id, Some(args)),
        None => (data, None),
    };
    let id = id.parse::<u64>().ok()?;
    let args = args
        .and_then(|raw| serde_json::from_str::<Vec<Value>>(raw).ok())
        .unwrap_or_default();
    Some((id, args))
}

/// Payload of an event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventPayload {
    /// Parse an event frame's data; `None` for anything not shaped `{name, args}`.
    pub fn parse(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}
