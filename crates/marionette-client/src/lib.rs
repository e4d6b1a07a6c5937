pub mod api;
pub mod config;
pub mod decoder;
pub mod pathfinding;
pub mod state;

pub use api::{ApiError, ChannelGameApi, GameApi};
pub use decoder::{PacketDecoder, TextPacketDecoder};
pub use pathfinding::{
    CachedMapLoader, GridPathfinder, MapError, MapGrid, MapLoader, OpenMapLoader, Pathfinder,
    Position,
};
pub use state::{EntityState, SharedState, StateChange};
