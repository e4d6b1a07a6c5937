use std::fmt;

/// Which way a packet travelled relative to the game client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketDirection {
    /// Server to client
    Inbound,
    /// Client to server
    Outbound,
}

/// Kind of trigger a condition is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionKind {
    RecvPacket,
    SendPacket,
    Periodic,
}

impl ConditionKind {
    pub const ALL: [ConditionKind; 3] = [
        ConditionKind::RecvPacket,
        ConditionKind::SendPacket,
        ConditionKind::Periodic,
    ];

    /// Tag used on the first line of a persisted condition
    pub fn tag(self) -> &'static str {
        match self {
            ConditionKind::RecvPacket => "recv_packet",
            ConditionKind::SendPacket => "send_packet",
            ConditionKind::Periodic => "periodical",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "recv_packet" => Some(ConditionKind::RecvPacket),
            "send_packet" => Some(ConditionKind::SendPacket),
            "periodical" => Some(ConditionKind::Periodic),
            _ => None,
        }
    }

    /// The packet-triggered kind matching a traffic direction
    pub fn for_direction(direction: PacketDirection) -> Self {
        match direction {
            PacketDirection::Inbound => ConditionKind::RecvPacket,
            PacketDirection::Outbound => ConditionKind::SendPacket,
        }
    }

    pub fn is_packet(self) -> bool {
        !matches!(self, ConditionKind::Periodic)
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A decoded protocol packet.
///
/// Fields are the whitespace separated tokens of the raw text; the first
/// field is the packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub direction: PacketDirection,
    pub raw: String,
    pub fields: Vec<String>,
}

impl PacketEvent {
    pub fn decode(direction: PacketDirection, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let fields = raw.split_whitespace().map(str::to_string).collect();
        Self {
            direction,
            raw,
            fields,
        }
    }

    pub fn header(&self) -> Option<&str> {
        self.fields.first().map(String::as_str)
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Parse field `index` as a number, `None` when missing or malformed
    pub fn number<T: std::str::FromStr>(&self, index: usize) -> Option<T> {
        self.field(index).and_then(|f| f.parse().ok())
    }
}

/// A single serialized movement intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkRequest {
    pub x: i32,
    pub y: i32,
    pub with_companion: bool,
}

impl WalkRequest {
    pub fn new(x: i32, y: i32, with_companion: bool) -> Self {
        Self {
            x,
            y,
            with_companion,
        }
    }
}
