use marionette_events::{ClientAction, QueryKind};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("game client is disconnected")]
    Disconnected,
}

/// The live game-client API a controlled entity is driven through.
///
/// Calls are fire-and-forget: queries populate entity state later through
/// the packet stream.
pub trait GameApi: Send + Sync + 'static {
    fn send_packet(&self, packet: &str) -> Result<(), ApiError>;
    fn recv_packet(&self, packet: &str) -> Result<(), ApiError>;
    fn player_walk(&self, x: i32, y: i32) -> Result<(), ApiError>;
    fn pets_walk(&self, x: i32, y: i32) -> Result<(), ApiError>;
    fn query(&self, kind: QueryKind) -> Result<(), ApiError>;
}

/// A `GameApi` that forwards every call as a `ClientAction` on a channel
#[derive(Debug, Clone)]
pub struct ChannelGameApi {
    action_tx: UnboundedSender<ClientAction>,
}

impl ChannelGameApi {
    pub fn new(action_tx: UnboundedSender<ClientAction>) -> Self {
        Self { action_tx }
    }

    fn send(&self, action: ClientAction) -> Result<(), ApiError> {
        self.action_tx
            .send(action)
            .map_err(|_| ApiError::Disconnected)
    }
}

impl GameApi for ChannelGameApi {
    fn send_packet(&self, packet: &str) -> Result<(), ApiError> {
        self.send(ClientAction::SendPacket(packet.to_string()))
    }

    fn recv_packet(&self, packet: &str) -> Result<(), ApiError> {
        self.send(ClientAction::RecvPacket(packet.to_string()))
    }

    fn player_walk(&self, x: i32, y: i32) -> Result<(), ApiError> {
        self.send(ClientAction::PlayerWalk { x, y })
    }

    fn pets_walk(&self, x: i32, y: i32) -> Result<(), ApiError> {
        self.send(ClientAction::PetsWalk { x, y })
    }

    fn query(&self, kind: QueryKind) -> Result<(), ApiError> {
        self.send(ClientAction::Query(kind))
    }
}
