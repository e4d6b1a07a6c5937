/// Bulk state queries issued against the game client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    PlayerInfo,
    Inventory,
    Skills,
    MapEntities,
}

impl QueryKind {
    pub fn name(self) -> &'static str {
        match self {
            QueryKind::PlayerInfo => "player_info",
            QueryKind::Inventory => "inventory",
            QueryKind::Skills => "skills",
            QueryKind::MapEntities => "map_entities",
        }
    }
}

/// Commands sent to the game client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Send a packet to the server
    SendPacket(String),
    /// Inject a packet as if the server had sent it
    RecvPacket(String),
    /// Move the controlled entity
    PlayerWalk { x: i32, y: i32 },
    /// Move the entity's companions
    PetsWalk { x: i32, y: i32 },
    /// Refresh part of the entity state
    Query(QueryKind),
}
