//! Offline runs against a simulated game client.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use marionette_client::config::MarionetteConfig;
use marionette_client::{ApiError, GameApi};
use marionette_events::{ClientAction, ConditionKind, EventSender, QueryKind};
use tracing::{info, warn};

use crate::agent::{packet_channel, Agent, AgentError, PacketFeed};
use crate::replay::{self, ReplayStep};

/// A game client that answers movement instantly.
///
/// `player_walk` teleports the player by echoing a `walk x y` packet as
/// outbound traffic; sent and injected packets are echoed likewise.
pub struct SimulatedGameApi {
    feed: PacketFeed,
    actions: Mutex<Vec<ClientAction>>,
}

impl SimulatedGameApi {
    pub fn new(feed: PacketFeed) -> Self {
        Self {
            feed,
            actions: Mutex::new(Vec::new()),
        }
    }

    /// Every call made so far, in order
    pub fn actions(&self) -> Vec<ClientAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, action: ClientAction) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }
}

fn disconnected(_: AgentError) -> ApiError {
    ApiError::Disconnected
}

impl GameApi for SimulatedGameApi {
    fn send_packet(&self, packet: &str) -> Result<(), ApiError> {
        self.record(ClientAction::SendPacket(packet.to_string()));
        self.feed.send(packet).map_err(disconnected)
    }

    fn recv_packet(&self, packet: &str) -> Result<(), ApiError> {
        self.record(ClientAction::RecvPacket(packet.to_string()));
        self.feed.recv(packet).map_err(disconnected)
    }

    fn player_walk(&self, x: i32, y: i32) -> Result<(), ApiError> {
        self.record(ClientAction::PlayerWalk { x, y });
        self.feed.send(format!("walk {} {}", x, y)).map_err(disconnected)
    }

    fn pets_walk(&self, x: i32, y: i32) -> Result<(), ApiError> {
        self.record(ClientAction::PetsWalk { x, y });
        Ok(())
    }

    fn query(&self, kind: QueryKind) -> Result<(), ApiError> {
        self.record(ClientAction::Query(kind));
        Ok(())
    }
}

pub struct SimulationOptions {
    pub agent: String,
    pub config: MarionetteConfig,
    /// Overrides the agent's configured condition directory
    pub conditions_dir: Option<PathBuf>,
    pub replay: Vec<ReplayStep>,
    /// How long conditions may keep running after the last replay step
    pub settle: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub loaded: usize,
    /// Conditions still registered at the end of the run
    pub remaining: usize,
    pub actions: Vec<ClientAction>,
}

/// Load an agent's conditions, replay `options.replay` into it and report
/// what the conditions did
pub async fn run_simulation(
    options: SimulationOptions,
    events: EventSender,
) -> Result<SimulationReport, AgentError> {
    let (feed, stream) = packet_channel();
    let api = Arc::new(SimulatedGameApi::new(feed.clone()));

    let mut agent_config = options
        .config
        .agents
        .get(&options.agent)
        .cloned()
        .unwrap_or_default();
    if let Some(dir) = options.conditions_dir {
        agent_config.conditions_dir = Some(dir);
    }

    let agent = Agent::builder(options.agent.clone())
        .with_engine_config(options.config.engine.clone())
        .with_walk_config(options.config.walk.clone())
        .with_agent_config(agent_config)
        .with_api(Arc::clone(&api) as Arc<dyn GameApi>)
        .with_packets(feed.clone(), stream)
        .with_events(events)
        .build()?;

    let loaded = agent.load_conditions()?;
    info!(target: "runner", entity = %agent.name(), "Replaying {} step(s) over {} condition(s)", options.replay.len(), loaded);
    agent.start();

    let played = replay::play(&options.replay, &feed).await;
    tokio::time::sleep(options.settle).await;

    let remaining = ConditionKind::ALL
        .into_iter()
        .map(|kind| agent.engine().conditions(kind).len())
        .sum();
    if let Err(e) = tokio::task::spawn_blocking(move || agent.shutdown()).await {
        warn!(target: "runner", "Agent shutdown failed: {}", e);
    }
    played?;

    Ok(SimulationReport {
        loaded,
        remaining,
        actions: api.actions(),
    })
}
