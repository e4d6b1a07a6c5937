use std::sync::{Arc, PoisonError, RwLock};

use marionette_events::{PacketDirection, PacketEvent, QueryKind};

use crate::pathfinding::Position;

/// Live state of the controlled entity, fed by the packet stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub x: i32,
    pub y: i32,
    pub map_id: i32,
    /// Bumped on every confirmed map change
    pub map_epoch: u64,
    pub hp: i64,
    pub max_hp: i64,
    pub hp_percent: i64,
    pub mp: i64,
    pub max_mp: i64,
    pub mp_percent: i64,
    pub level: i64,
    pub gold: i64,
    pub can_attack: bool,
    pub can_move: bool,
    pub speed: i64,
    pub leader_id: Option<i64>,
    /// Position of the entity's party within its group, starting at 1
    pub subgroup_index: Option<i64>,
}

/// Side effects of applying a packet that the caller must act on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChange {
    pub map_changed: bool,
    pub queries: Vec<QueryKind>,
}

fn percent(current: i64, max: i64) -> i64 {
    if max <= 0 {
        0
    } else {
        current * 100 / max
    }
}

impl EntityState {
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }

    /// Update tracked fields from a packet. Malformed packets are ignored.
    pub fn apply(&mut self, packet: &PacketEvent) -> StateChange {
        let mut change = StateChange::default();
        let Some(header) = packet.header() else {
            return change;
        };

        match (packet.direction, header) {
            (PacketDirection::Outbound, "walk") => {
                if let (Some(x), Some(y)) = (packet.number(1), packet.number(2)) {
                    self.x = x;
                    self.y = y;
                }
            }
            (PacketDirection::Inbound, "stat") => {
                if let (Some(hp), Some(max_hp), Some(mp), Some(max_mp)) = (
                    packet.number(1),
                    packet.number(2),
                    packet.number(3),
                    packet.number(4),
                ) {
                    self.hp = hp;
                    self.max_hp = max_hp;
                    self.mp = mp;
                    self.max_mp = max_mp;
                    self.hp_percent = percent(hp, max_hp);
                    self.mp_percent = percent(mp, max_mp);
                }
            }
            (PacketDirection::Inbound, "c_info") => {
                if let Some(name) = packet.field(1) {
                    self.name = Some(name.to_string());
                }
                if let Some(id) = packet.number(6) {
                    self.id = Some(id);
                }
            }
            (PacketDirection::Inbound, "at") => {
                if let (Some(x), Some(y)) = (packet.number(3), packet.number(4)) {
                    self.x = x;
                    self.y = y;
                }
            }
            (PacketDirection::Inbound, "cond") => {
                if let (Some(attack), Some(moving)) =
                    (packet.number::<i64>(3), packet.number::<i64>(4))
                {
                    self.can_attack = attack != 0;
                    self.can_move = moving != 0;
                }
                if let Some(speed) = packet.number(5) {
                    self.speed = speed;
                }
            }
            (PacketDirection::Inbound, "c_map") => {
                if packet.field(3) == Some("1") {
                    if let Some(map_id) = packet.number(2) {
                        self.map_id = map_id;
                        self.map_epoch += 1;
                        change.map_changed = true;
                        change.queries.push(QueryKind::MapEntities);
                    }
                }
            }
            (PacketDirection::Inbound, "gold") => {
                if let Some(gold) = packet.number(1) {
                    self.gold = gold;
                }
            }
            (PacketDirection::Inbound, "lev") => {
                if let Some(level) = packet.number(1) {
                    self.level = level;
                }
            }
            (PacketDirection::Inbound, "ivn") => change.queries.push(QueryKind::Inventory),
            (PacketDirection::Inbound, "ski") => change.queries.push(QueryKind::Skills),
            _ => {}
        }

        change
    }
}

/// Entity state shared between the ingestion task and running conditions
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<EntityState>>,
}

impl SharedState {
    pub fn new(state: EntityState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn snapshot(&self) -> EntityState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&EntityState) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut EntityState) -> R) -> R {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn apply(&self, packet: &PacketEvent) -> StateChange {
        self.update(|state| state.apply(packet))
    }

    pub fn position(&self) -> Position {
        self.read(EntityState::position)
    }

    pub fn map_epoch(&self) -> u64 {
        self.read(|s| s.map_epoch)
    }

    pub fn leader_id(&self) -> Option<i64> {
        self.read(|s| s.leader_id)
    }

    pub fn set_leader_id(&self, leader_id: Option<i64>) {
        self.update(|s| s.leader_id = leader_id);
    }

    pub fn subgroup_index(&self) -> Option<i64> {
        self.read(|s| s.subgroup_index)
    }

    pub fn set_subgroup_index(&self, index: Option<i64>) {
        self.update(|s| s.subgroup_index = index);
    }
}
