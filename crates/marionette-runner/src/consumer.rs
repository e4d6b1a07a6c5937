use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use marionette_events::{AgentEvent, ConditionEvent, EventConsumer, EventEnvelope, EventType};

/// Event consumer that logs events to the console
#[derive(Debug, Default)]
pub struct LoggingConsumer {
    handled: u64,
}

impl LoggingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }
}

impl EventConsumer for LoggingConsumer {
    fn handle_event(&mut self, envelope: EventEnvelope) {
        self.handled += 1;
        let entity = envelope.context.entity_id;
        match envelope.event {
            EventType::Condition(event) => match event {
                ConditionEvent::Added { kind, name } => {
                    info!(target: "events", entity, "Condition added: {} '{}'", kind, name);
                }
                ConditionEvent::Removed {
                    kind,
                    name,
                    error: None,
                } => {
                    info!(target: "events", entity, "Condition removed: {} '{}'", kind, name);
                }
                ConditionEvent::Removed {
                    kind,
                    name,
                    error: Some(message),
                } => {
                    error!(target: "events", entity, "Condition removed after error: {} '{}': {}", kind, name, message);
                }
                ConditionEvent::Toggled { kind, name, active } => {
                    info!(
                        target: "events",
                        entity,
                        "Condition {}: {} '{}'",
                        if active { "activated" } else { "deactivated" },
                        kind,
                        name
                    );
                }
                ConditionEvent::CompileFailed {
                    kind,
                    name,
                    message,
                } => {
                    warn!(target: "events", entity, "Condition failed to compile: {} '{}': {}", kind, name, message);
                }
            },
            EventType::Agent(event) => match event {
                AgentEvent::Started => info!(target: "events", entity, "Agent started"),
                AgentEvent::Stopped => info!(target: "events", entity, "Agent stopped"),
                AgentEvent::MapChanged { map_id } => {
                    info!(target: "events", entity, "Map changed to {}", map_id);
                }
                AgentEvent::Packet(packet) => {
                    debug!(target: "events", entity, "{:?}: {}", packet.direction, packet.raw);
                }
            },
        }
    }
}

/// Feed every event on `rx` to `consumer` until the bus closes
pub async fn run_consumer(
    mut rx: broadcast::Receiver<EventEnvelope>,
    mut consumer: Box<dyn EventConsumer>,
) {
    info!(target: "events", "Event handler task started");
    loop {
        match rx.recv().await {
            Ok(envelope) => consumer.handle_event(envelope),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                error!(target: "events", "Event receiver lagged, {} messages were skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!(target: "events", "Event channel closed");
                break;
            }
        }
    }
    info!(target: "events", "Event handler task stopped");
}
