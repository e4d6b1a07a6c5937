//! One controlled entity: its executor, packet ingestion and condition engine.

use std::sync::Arc;
use std::time::Duration;

use marionette_client::config::{AgentConfig, EngineConfig, WalkConfig};
use marionette_client::{
    GameApi, GridPathfinder, MapLoader, OpenMapLoader, PacketDecoder, Pathfinder, SharedState,
    TextPacketDecoder,
};
use marionette_conditions::{BuildError, ConditionEngine, EngineError, GroupStore};
use marionette_events::{
    AgentEvent, EventSender, EventSource, EventType, PacketDirection, QueryKind,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::EntityExecutor;
use crate::replay::ReplayError;

/// Wait before asking for the entities of a newly entered map
const MAP_QUERY_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start executor: {0}")]
    Executor(#[source] std::io::Error),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error("packet ingestion has stopped")]
    Closed,
}

/// Undecoded protocol text captured from the game client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub direction: PacketDirection,
    pub text: String,
}

/// Thread-safe handoff into an entity's packet ingestion
#[derive(Debug, Clone)]
pub struct PacketFeed {
    tx: mpsc::UnboundedSender<RawPacket>,
}

impl PacketFeed {
    pub fn push(&self, direction: PacketDirection, text: impl Into<String>) -> Result<(), AgentError> {
        self.tx
            .send(RawPacket {
                direction,
                text: text.into(),
            })
            .map_err(|_| AgentError::Closed)
    }

    pub fn recv(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.push(PacketDirection::Inbound, text)
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.push(PacketDirection::Outbound, text)
    }
}

/// Receiving end of a [`PacketFeed`], consumed by [`AgentBuilder::build`]
pub struct PacketStream {
    rx: mpsc::UnboundedReceiver<RawPacket>,
}

impl PacketStream {
    pub async fn next(&mut self) -> Option<RawPacket> {
        self.rx.recv().await
    }
}

pub fn packet_channel() -> (PacketFeed, PacketStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketFeed { tx }, PacketStream { rx })
}

pub struct AgentBuilder {
    name: String,
    engine_config: EngineConfig,
    walk_config: WalkConfig,
    agent_config: AgentConfig,
    api: Option<Arc<dyn GameApi>>,
    pathfinder: Arc<dyn Pathfinder>,
    map_loader: Box<dyn MapLoader>,
    decoder: Arc<dyn PacketDecoder>,
    state: SharedState,
    group_store: GroupStore,
    events: Option<EventSender>,
    packets: Option<(PacketFeed, PacketStream)>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_config: EngineConfig::default(),
            walk_config: WalkConfig::default(),
            agent_config: AgentConfig::default(),
            api: None,
            pathfinder: Arc::new(GridPathfinder),
            map_loader: Box::new(OpenMapLoader {
                width: 256,
                height: 256,
            }),
            decoder: Arc::new(TextPacketDecoder),
            state: SharedState::default(),
            group_store: GroupStore::new(),
            events: None,
            packets: None,
        }
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    pub fn with_walk_config(mut self, config: WalkConfig) -> Self {
        self.walk_config = config;
        self
    }

    pub fn with_agent_config(mut self, config: AgentConfig) -> Self {
        self.agent_config = config;
        self
    }

    pub fn with_api(mut self, api: Arc<dyn GameApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_pathfinder(mut self, pathfinder: Arc<dyn Pathfinder>) -> Self {
        self.pathfinder = pathfinder;
        self
    }

    pub fn with_map_loader(mut self, loader: Box<dyn MapLoader>) -> Self {
        self.map_loader = loader;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn PacketDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = state;
        self
    }

    pub fn with_group_store(mut self, store: GroupStore) -> Self {
        self.group_store = store;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Use an existing packet channel, e.g. one the game api also feeds
    pub fn with_packets(mut self, feed: PacketFeed, stream: PacketStream) -> Self {
        self.packets = Some((feed, stream));
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let api = self.api.ok_or(BuildError::MissingApi)?;
        let executor = EntityExecutor::spawn(&self.name).map_err(AgentError::Executor)?;
        let events = self
            .events
            .unwrap_or_else(|| EventSender::detached(0));

        if let Some(leader_id) = self.agent_config.leader_id {
            self.state.set_leader_id(Some(leader_id));
        }
        if let Some(index) = self.agent_config.subgroup_index {
            self.state.set_subgroup_index(Some(index));
        }

        let engine = ConditionEngine::builder(self.name.clone())
            .with_engine_config(self.engine_config)
            .with_walk_config(self.walk_config)
            .with_api(Arc::clone(&api))
            .with_pathfinder(self.pathfinder)
            .with_map_loader(self.map_loader)
            .with_state(self.state.clone())
            .with_group_store(self.group_store)
            .with_events(events.clone())
            .with_runtime(executor.handle().clone())
            .build()?;

        let (feed, stream) = self.packets.unwrap_or_else(packet_channel);
        let ingestion = executor.handle().spawn(run_ingestion(
            stream,
            Ingestion {
                engine: engine.clone(),
                decoder: self.decoder,
                state: self.state,
                api,
                events: events.clone(),
            },
        ));

        Ok(Agent {
            name: self.name,
            agent_config: self.agent_config,
            engine,
            feed,
            events,
            ingestion,
            executor,
        })
    }
}

pub struct Agent {
    name: String,
    agent_config: AgentConfig,
    engine: ConditionEngine,
    feed: PacketFeed,
    events: EventSender,
    ingestion: JoinHandle<()>,
    executor: EntityExecutor,
}

impl Agent {
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &ConditionEngine {
        &self.engine
    }

    pub fn feed(&self) -> PacketFeed {
        self.feed.clone()
    }

    /// Load the agent's condition directory. A missing directory loads nothing.
    pub fn load_conditions(&self) -> Result<usize, AgentError> {
        let dir = self.agent_config.conditions_dir(&self.name);
        if !dir.is_dir() {
            warn!(target: "runner", entity = %self.name, "No condition directory at {}", dir.display());
            return Ok(0);
        }
        Ok(self.engine.load_dir(&dir)?)
    }

    pub fn start(&self) {
        self.engine.start();
        self.events
            .emit(EventType::Agent(AgentEvent::Started), EventSource::System);
    }

    pub fn stop(&self) {
        self.engine.stop();
        self.events
            .emit(EventType::Agent(AgentEvent::Stopped), EventSource::System);
    }

    /// Stop the engine and tear down the entity's executor
    pub fn shutdown(self) {
        self.stop();
        self.ingestion.abort();
        self.executor.shutdown();
        info!(target: "runner", entity = %self.name, "Agent shut down");
    }
}

struct Ingestion {
    engine: ConditionEngine,
    decoder: Arc<dyn PacketDecoder>,
    state: SharedState,
    api: Arc<dyn GameApi>,
    events: EventSender,
}

/// Decode packets, update entity state, then hand them to the dispatcher
async fn run_ingestion(mut stream: PacketStream, ctx: Ingestion) {
    debug!(target: "runner", entity = %ctx.engine.name(), "Packet ingestion started");
    while let Some(raw) = stream.next().await {
        let packet = ctx.decoder.decode(raw.direction, &raw.text);
        let change = ctx.state.apply(&packet);
        ctx.events.emit(
            EventType::Agent(AgentEvent::Packet(packet.clone())),
            EventSource::Network,
        );

        if change.map_changed {
            let map_id = ctx.state.read(|s| s.map_id);
            ctx.events.emit(
                EventType::Agent(AgentEvent::MapChanged { map_id }),
                EventSource::Network,
            );
        }
        for kind in change.queries {
            let api = Arc::clone(&ctx.api);
            let delay = if kind == QueryKind::MapEntities {
                MAP_QUERY_DELAY
            } else {
                Duration::ZERO
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = api.query(kind) {
                    warn!(target: "runner", "{} query failed: {}", kind.name(), e);
                }
            });
        }

        if !ctx.engine.is_stopped() {
            ctx.engine.dispatch_packet(&packet);
        }
    }
    debug!(target: "runner", entity = %ctx.engine.name(), "Packet ingestion stopped");
}
