use marionette_events::{PacketDirection, PacketEvent};

/// Turns raw protocol text into a `PacketEvent`
pub trait PacketDecoder: Send + Sync + 'static {
    fn decode(&self, direction: PacketDirection, raw: &str) -> PacketEvent;
}

/// Decoder for the plain-text protocol, where fields are separated by whitespace
#[derive(Debug, Clone, Copy, Default)]
pub struct TextPacketDecoder;

impl PacketDecoder for TextPacketDecoder {
    fn decode(&self, direction: PacketDirection, raw: &str) -> PacketEvent {
        PacketEvent::decode(direction, raw.trim_end_matches(['\r', '\n']))
    }
}
