use std::collections::HashMap;
use std::time::Duration;

use marionette_events::ConditionKind;
use tokio::time::Instant;

use crate::error::ControlError;
use crate::registry::{ConditionId, ConditionRegistry};
use crate::script::Value;

/// Which of the two write-only `cond` properties was assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    On,
    Off,
}

impl ControlOp {
    pub fn from_property(name: &str) -> Option<Self> {
        match name {
            "on" => Some(ControlOp::On),
            "off" => Some(ControlOp::Off),
            _ => None,
        }
    }

    fn active(self) -> bool {
        matches!(self, ControlOp::On)
    }
}

/// A condition whose activation flag was changed by a control assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Toggle {
    pub id: ConditionId,
    pub kind: ConditionKind,
    pub name: String,
    pub active: bool,
}

/// Apply `cond.on = value` or `cond.off = value` against the sequence index.
///
/// `current` is the condition performing the assignment; `cond.off = 0`
/// deactivates every other active condition.
pub fn apply_control(
    registry: &mut ConditionRegistry,
    op: ControlOp,
    value: &Value,
    current: Option<ConditionId>,
) -> Result<Vec<Toggle>, ControlError> {
    let n = value
        .as_i64()
        .ok_or(ControlError::NotAnInteger(value.type_name()))?;
    if n < 0 || (n == 0 && op == ControlOp::On) {
        return Err(ControlError::StartsAtOne);
    }

    let index = registry.sequence_index();
    if index.is_empty() {
        return Err(ControlError::NoConditions);
    }

    let mut toggled = Vec::new();
    if n == 0 {
        for entry in index.iter().filter(|e| Some(e.id) != current) {
            if let Ok(true) = registry.set_active(entry.kind, entry.index, false) {
                toggled.push(Toggle {
                    id: entry.id,
                    kind: entry.kind,
                    name: entry.name.clone(),
                    active: false,
                });
            }
        }
        return Ok(toggled);
    }

    let entry = usize::try_from(n - 1)
        .ok()
        .and_then(|i| index.get(i))
        .ok_or(ControlError::OutOfRange {
            index: n,
            max: index.len(),
        })?;
    if let Ok(true) = registry.set_active(entry.kind, entry.index, op.active()) {
        toggled.push(Toggle {
            id: entry.id,
            kind: entry.kind,
            name: entry.name.clone(),
            active: op.active(),
        });
    }
    Ok(toggled)
}

/// Tracks when conditions last changed state or ran
#[derive(Debug)]
pub struct ActivityClock {
    last_change: Instant,
    last_activity: Instant,
    per_condition: HashMap<(ConditionKind, String), Instant>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            last_change: now,
            last_activity: now,
            per_condition: HashMap::new(),
        }
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_activity(&mut self, kind: ConditionKind, name: &str) {
        let now = Instant::now();
        self.last_activity = now;
        self.per_condition.insert((kind, name.to_string()), now);
    }

    pub fn record_state_change(&mut self) {
        let now = Instant::now();
        self.last_change = now;
        self.last_activity = now;
    }

    /// Time since the last state change, or since `target` last ran.
    ///
    /// `None` when `target` never ran.
    pub fn elapsed(&self, target: Option<(ConditionKind, &str)>) -> Option<Duration> {
        match target {
            None => Some(self.last_change.elapsed()),
            Some((kind, name)) => self
                .per_condition
                .get(&(kind, name.to_string()))
                .map(Instant::elapsed),
        }
    }

    pub fn since_last_activity(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn reset(&mut self, target: Option<(ConditionKind, &str)>) {
        match target {
            Some((kind, name)) => self.record_activity(kind, name),
            None => self.record_state_change(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
