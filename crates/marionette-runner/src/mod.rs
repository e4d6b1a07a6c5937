mod agent;
mod consumer;
mod executor;
pub mod logging;
pub mod replay;
mod sim;

pub use agent::{packet_channel, Agent, AgentBuilder, AgentError, PacketFeed, PacketStream, RawPacket};
pub use consumer::{run_consumer, LoggingConsumer};
pub use executor::EntityExecutor;
pub use replay::{ReplayError, ReplayStep};
pub use sim::{run_simulation, SimulatedGameApi, SimulationOptions, SimulationReport};
