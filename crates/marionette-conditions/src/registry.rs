use std::cmp::Ordering;

use marionette_events::ConditionKind;

use crate::error::RegistryError;

/// Interval given to periodic conditions added without one
pub const DEFAULT_INTERVAL: f64 = 1.0;

/// Identity of one registry entry, never reused within a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionId(u64);

impl std::fmt::Display for ConditionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub id: ConditionId,
    pub kind: ConditionKind,
    pub name: String,
    pub source: String,
    pub active: bool,
    /// Seconds; periodic conditions only
    pub interval: Option<f64>,
    /// Most recent compile failure; periodic conditions only
    pub last_error: Option<String>,
}

/// One position in the merged natural ordering of every condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceEntry {
    pub kind: ConditionKind,
    pub index: usize,
    pub name: String,
    pub id: ConditionId,
}

/// Ordered per-kind condition lists of one entity
#[derive(Debug, Default)]
pub struct ConditionRegistry {
    recv: Vec<Condition>,
    send: Vec<Condition>,
    periodic: Vec<Condition>,
    next_id: u64,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, kind: ConditionKind) -> &Vec<Condition> {
        match kind {
            ConditionKind::RecvPacket => &self.recv,
            ConditionKind::SendPacket => &self.send,
            ConditionKind::Periodic => &self.periodic,
        }
    }

    fn entries_mut(&mut self, kind: ConditionKind) -> &mut Vec<Condition> {
        match kind {
            ConditionKind::RecvPacket => &mut self.recv,
            ConditionKind::SendPacket => &mut self.send,
            ConditionKind::Periodic => &mut self.periodic,
        }
    }

    /// Append a condition. Periodic conditions get [`DEFAULT_INTERVAL`].
    pub fn add(
        &mut self,
        kind: ConditionKind,
        name: &str,
        source: &str,
        active: bool,
    ) -> Result<ConditionId, RegistryError> {
        let interval = (kind == ConditionKind::Periodic).then_some(DEFAULT_INTERVAL);
        self.insert(kind, name, source, active, interval)
    }

    pub fn add_periodic(
        &mut self,
        name: &str,
        source: &str,
        active: bool,
        interval: f64,
    ) -> Result<ConditionId, RegistryError> {
        self.insert(ConditionKind::Periodic, name, source, active, Some(interval))
    }

    fn insert(
        &mut self,
        kind: ConditionKind,
        name: &str,
        source: &str,
        active: bool,
        interval: Option<f64>,
    ) -> Result<ConditionId, RegistryError> {
        if self.find(kind, name).is_some() {
            return Err(RegistryError::DuplicateName {
                kind,
                name: name.to_string(),
            });
        }

        let id = ConditionId(self.next_id);
        self.next_id += 1;
        self.entries_mut(kind).push(Condition {
            id,
            kind,
            name: name.to_string(),
            source: source.to_string(),
            active,
            interval,
            last_error: None,
        });
        Ok(id)
    }

    fn out_of_range(&self, kind: ConditionKind, index: usize) -> RegistryError {
        RegistryError::IndexOutOfRange {
            kind,
            index,
            len: self.entries(kind).len(),
        }
    }

    pub fn remove(&mut self, kind: ConditionKind, index: usize) -> Result<Condition, RegistryError> {
        if index >= self.entries(kind).len() {
            return Err(self.out_of_range(kind, index));
        }
        Ok(self.entries_mut(kind).remove(index))
    }

    /// Remove by identity; `None` when it is already gone
    pub fn remove_by_id(&mut self, id: ConditionId) -> Option<Condition> {
        let (kind, index) = self.locate(id)?;
        Some(self.entries_mut(kind).remove(index))
    }

    /// Set the activation flag, returning whether it changed
    pub fn set_active(
        &mut self,
        kind: ConditionKind,
        index: usize,
        active: bool,
    ) -> Result<bool, RegistryError> {
        let condition = self.get_mut(kind, index)?;
        let changed = condition.active != active;
        condition.active = active;
        Ok(changed)
    }

    pub fn set_active_by_id(&mut self, id: ConditionId, active: bool) -> Option<bool> {
        let (kind, index) = self.locate(id)?;
        self.set_active(kind, index, active).ok()
    }

    pub fn set_source(
        &mut self,
        kind: ConditionKind,
        index: usize,
        source: &str,
    ) -> Result<(), RegistryError> {
        let condition = self.get_mut(kind, index)?;
        if condition.source != source {
            condition.source = source.to_string();
            condition.last_error = None;
        }
        Ok(())
    }

    pub fn set_interval(&mut self, index: usize, interval: f64) -> Result<(), RegistryError> {
        self.get_mut(ConditionKind::Periodic, index)?.interval = Some(interval);
        Ok(())
    }

    pub fn set_last_error(&mut self, id: ConditionId, error: Option<String>) {
        if let Some((kind, index)) = self.locate(id) {
            self.entries_mut(kind)[index].last_error = error;
        }
    }

    pub fn list(&self, kind: ConditionKind) -> &[Condition] {
        self.entries(kind)
    }

    pub fn get(&self, kind: ConditionKind, index: usize) -> Option<&Condition> {
        self.entries(kind).get(index)
    }

    fn get_mut(&mut self, kind: ConditionKind, index: usize) -> Result<&mut Condition, RegistryError> {
        if index >= self.entries(kind).len() {
            return Err(self.out_of_range(kind, index));
        }
        Ok(&mut self.entries_mut(kind)[index])
    }

    /// Exact, case-sensitive lookup by name within `kind`
    pub fn find(&self, kind: ConditionKind, name: &str) -> Option<(usize, &Condition)> {
        self.entries(kind)
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    pub fn find_by_id(&self, id: ConditionId) -> Option<&Condition> {
        let (kind, index) = self.locate(id)?;
        self.entries(kind).get(index)
    }

    fn locate(&self, id: ConditionId) -> Option<(ConditionKind, usize)> {
        ConditionKind::ALL.into_iter().find_map(|kind| {
            self.entries(kind)
                .iter()
                .position(|c| c.id == id)
                .map(|index| (kind, index))
        })
    }

    /// Every condition of every kind, ordered naturally by name.
    ///
    /// Equal names keep receive, send, periodic order.
    pub fn sequence_index(&self) -> Vec<SequenceEntry> {
        let mut entries: Vec<SequenceEntry> = ConditionKind::ALL
            .into_iter()
            .flat_map(|kind| {
                self.entries(kind)
                    .iter()
                    .enumerate()
                    .map(move |(index, c)| SequenceEntry {
                        kind,
                        index,
                        name: c.name.clone(),
                        id: c.id,
                    })
            })
            .collect();
        entries.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        entries
    }

    /// Snapshot of the active conditions of `kind`, in registry order
    pub fn active_of_kind(&self, kind: ConditionKind) -> Vec<Condition> {
        self.entries(kind)
            .iter()
            .filter(|c| c.active)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.recv.clear();
        self.send.clear();
        self.periodic.clear();
    }

    pub fn len(&self) -> usize {
        self.recv.len() + self.send.len() + self.periodic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Chunk<'a> {
    Text(&'a str),
    Number(&'a str),
}

fn chunks(s: &str) -> impl Iterator<Item = Chunk<'_>> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let numeric = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != numeric)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(end);
        rest = tail;
        Some(if numeric {
            Chunk::Number(chunk)
        } else {
            Chunk::Text(chunk)
        })
    })
}

/// Numeric-aware ordering: `attr2` sorts before `attr10`.
///
/// Text runs compare case-insensitively, digit runs by value.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = chunks(a);
    let mut right = chunks(b);
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Chunk::Number(x)), Some(Chunk::Number(y))) => {
                let x = x.trim_start_matches('0');
                let y = y.trim_start_matches('0');
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Some(Chunk::Number(_)), Some(Chunk::Text(_))) => Ordering::Less,
            (Some(Chunk::Text(_)), Some(Chunk::Number(_))) => Ordering::Greater,
            (Some(Chunk::Text(x)), Some(Chunk::Text(y))) => x.to_lowercase().cmp(&y.to_lowercase()),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}
