/// Core event system traits and types for marionette
///
/// This crate provides the vocabulary shared by the condition engine, the
/// game-client boundary and the runner, so that consumers can be written
/// without circular dependencies.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

mod actions;
mod packet;

pub use actions::{ClientAction, QueryKind};
pub use packet::{ConditionKind, PacketDirection, PacketEvent, WalkRequest};

// ============================================================================
// Event Source and Context
// ============================================================================

/// Source of the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Event originated from the packet stream
    Network,
    /// Event originated from the condition engine
    Engine,
    /// Event originated from a running condition script
    Script,
    /// Event originated from system/lifecycle
    System,
}

/// Context information attached to all events
#[derive(Debug, Clone)]
pub struct EventContext {
    /// ID of the entity that generated this event
    pub entity_id: u32,
    /// Sequence number for this event, relative to the entity
    pub sequence: u64,
    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl EventContext {
    pub fn new(entity_id: u32, sequence: u64) -> Self {
        Self {
            entity_id,
            sequence,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Condition lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionEvent {
    Added {
        kind: ConditionKind,
        name: String,
    },
    /// Removed by the user, or by the engine after a failed execution
    Removed {
        kind: ConditionKind,
        name: String,
        error: Option<String>,
    },
    Toggled {
        kind: ConditionKind,
        name: String,
        active: bool,
    },
    CompileFailed {
        kind: ConditionKind,
        name: String,
        message: String,
    },
}

/// Per-entity agent events
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Started,
    Packet(PacketEvent),
    MapChanged { map_id: i32 },
    Stopped,
}

/// Unified event type
#[derive(Debug, Clone, PartialEq)]
pub enum EventType {
    Condition(ConditionEvent),
    Agent(AgentEvent),
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Complete event envelope
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: EventType,
    pub context: EventContext,
    pub timestamp: Instant,
    pub source: EventSource,
}

impl EventEnvelope {
    pub fn new(event: EventType, context: EventContext, source: EventSource) -> Self {
        Self {
            event,
            context,
            timestamp: Instant::now(),
            source,
        }
    }

    pub fn condition_event(
        event: ConditionEvent,
        entity_id: u32,
        sequence: u64,
        source: EventSource,
    ) -> Self {
        Self::new(
            EventType::Condition(event),
            EventContext::new(entity_id, sequence),
            source,
        )
    }

    pub fn agent_event(event: AgentEvent, entity_id: u32, sequence: u64, source: EventSource) -> Self {
        Self::new(
            EventType::Agent(event),
            EventContext::new(entity_id, sequence),
            source,
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Event sender that one entity uses to publish events
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<EventEnvelope>,
    entity_id: u32,
    sequence: Arc<AtomicU64>,
}

impl EventSender {
    pub fn new(sender: broadcast::Sender<EventEnvelope>, entity_id: u32) -> Self {
        Self {
            sender,
            entity_id,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sender with no subscribers, for engines running without a bus
    pub fn detached(entity_id: u32) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(sender, entity_id)
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        // No receivers is not an error
        let _ = self.sender.send(envelope);
    }

    /// Wrap `event` in an envelope stamped with the next sequence number
    pub fn emit(&self, event: EventType, source: EventSource) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let context = EventContext::new(self.entity_id, sequence);
        self.publish(EventEnvelope::new(event, context, source));
    }

    pub fn entity_id(&self) -> u32 {
        self.entity_id
    }
}

/// Central event bus that manages event distribution
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<EventEnvelope>) {
        let (sender, receiver) = broadcast::channel(capacity);
        (EventBus { sender }, receiver)
    }

    pub fn create_sender(&self, entity_id: u32) -> EventSender {
        EventSender::new(self.sender.clone(), entity_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

// ============================================================================
// Event Consumer Trait
// ============================================================================

/// Trait for consuming events, letting binaries plug in their own output
pub trait EventConsumer: Send + 'static {
    /// Handle an event envelope
    fn handle_event(&mut self, envelope: EventEnvelope);
}
