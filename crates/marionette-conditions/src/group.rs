use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use marionette_client::SharedState;
use tracing::debug;

use crate::error::SubgroupError;
use crate::script::Value;

/// Scope of a bucket of group variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    /// The party leader's entity id
    Leader(i64),
    /// Fallback for an entity whose leader is not known yet
    Private(u64),
}

type Buckets = HashMap<GroupId, HashMap<String, Value>>;

/// Subgroup values per leader id, then per subgroup index
type Subgroups = HashMap<i64, HashMap<i64, HashMap<String, i64>>>;

#[derive(Default)]
struct StoreInner {
    buckets: Mutex<Buckets>,
    subgroups: Mutex<Subgroups>,
    next_private: AtomicU64,
}

/// Process-wide group variable storage shared by every entity
#[derive(Clone, Default)]
pub struct GroupStore {
    inner: Arc<StoreInner>,
}

impl GroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A namespace for one entity, scoped through its live leader id
    pub fn namespace(&self, state: SharedState) -> GroupNamespace {
        let private = self.inner.next_private.fetch_add(1, Ordering::Relaxed);
        GroupNamespace {
            store: self.clone(),
            state,
            private_id: GroupId::Private(private),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.inner
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subgroups(&self) -> MutexGuard<'_, Subgroups> {
        self.inner
            .subgroups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of subgroups holding values under `leader`
    pub fn subgroup_count(&self, leader: i64) -> usize {
        self.lock_subgroups().get(&leader).map_or(0, HashMap::len)
    }

    /// Copy of one bucket, empty when it does not exist
    pub fn bucket(&self, id: GroupId) -> HashMap<String, Value> {
        self.lock().get(&id).cloned().unwrap_or_default()
    }
}

/// One entity's view of the group store
#[derive(Clone)]
pub struct GroupNamespace {
    store: GroupStore,
    state: SharedState,
    private_id: GroupId,
}

impl GroupNamespace {
    pub fn private_id(&self) -> GroupId {
        self.private_id
    }

    /// The leader id once known, the private id before that
    pub fn resolve(&self) -> GroupId {
        self.state
            .leader_id()
            .map(GroupId::Leader)
            .unwrap_or(self.private_id)
    }

    /// Lock the store with this entity's values already moved under its
    /// resolved id.
    fn locked(&self) -> (MutexGuard<'_, Buckets>, GroupId) {
        let id = self.resolve();
        let mut buckets = self.store.lock();
        if matches!(id, GroupId::Leader(_)) {
            if let Some(private) = buckets.remove(&self.private_id) {
                debug!(
                    target: "group",
                    "Moving {} group value(s) from {:?} to {:?}",
                    private.len(),
                    self.private_id,
                    id
                );
                buckets.entry(id).or_default().extend(private);
            }
        }
        (buckets, id)
    }

    pub fn get(&self, name: &str, default: Value) -> Value {
        let (buckets, id) = self.locked();
        buckets
            .get(&id)
            .and_then(|bucket| bucket.get(name))
            .cloned()
            .unwrap_or(default)
    }

    pub fn set(&self, name: &str, value: Value) {
        let (mut buckets, id) = self.locked();
        buckets.entry(id).or_default().insert(name.to_string(), value);
    }

    /// Remove `name`, dropping the bucket once it is empty
    pub fn delete(&self, name: &str) -> bool {
        let (mut buckets, id) = self.locked();
        let Some(bucket) = buckets.get_mut(&id) else {
            return false;
        };
        let removed = bucket.remove(name).is_some();
        if bucket.is_empty() {
            buckets.remove(&id);
        }
        removed
    }

    /// Drop every value in the current bucket
    pub fn clear(&self) {
        let (mut buckets, id) = self.locked();
        buckets.remove(&id);
    }

    fn subgroup_key(&self) -> Result<(i64, i64), SubgroupError> {
        let (leader, index) = self.state.read(|s| (s.leader_id, s.subgroup_index));
        let leader = leader.filter(|id| *id > 0).ok_or(SubgroupError::NoGroup)?;
        let index = index.filter(|i| *i > 0).ok_or(SubgroupError::NoSubgroup)?;
        Ok((leader, index))
    }

    pub fn subgroup_get(&self, name: &str, default: i64) -> Result<i64, SubgroupError> {
        let (leader, index) = self.subgroup_key()?;
        Ok(self
            .store
            .lock_subgroups()
            .get(&leader)
            .and_then(|subgroups| subgroups.get(&index))
            .and_then(|values| values.get(name))
            .copied()
            .unwrap_or(default))
    }

    /// Store `value`, which must be an integer or convert to one
    pub fn subgroup_set(&self, name: &str, value: &Value) -> Result<(), SubgroupError> {
        let (leader, index) = self.subgroup_key()?;
        let number = match value {
            Value::Int(n) => *n,
            Value::Bool(b) => i64::from(*b),
            Value::Float(f) if f.is_finite() && f.abs() < i64::MAX as f64 => f.trunc() as i64,
            Value::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| SubgroupError::NotAnInteger(format!("{:?}", s)))?,
            other => return Err(SubgroupError::NotAnInteger(other.type_name().to_string())),
        };
        self.store
            .lock_subgroups()
            .entry(leader)
            .or_default()
            .entry(index)
            .or_default()
            .insert(name.to_string(), number);
        Ok(())
    }

    /// Remove `name`, dropping emptied subgroups and leaders
    pub fn subgroup_delete(&self, name: &str) -> Result<bool, SubgroupError> {
        let (leader, index) = self.subgroup_key()?;
        let mut store = self.store.lock_subgroups();
        let Some(subgroups) = store.get_mut(&leader) else {
            return Ok(false);
        };
        let Some(values) = subgroups.get_mut(&index) else {
            return Ok(false);
        };
        let removed = values.remove(name).is_some();
        if values.is_empty() {
            subgroups.remove(&index);
        }
        if subgroups.is_empty() {
            store.remove(&leader);
        }
        Ok(removed)
    }

    /// Drop the values of every subgroup under the current leader
    pub fn clear_subgroups(&self) {
        if let Some(leader) = self.state.leader_id() {
            self.store.lock_subgroups().remove(&leader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marionette_client::EntityState;

    fn namespace(store: &GroupStore) -> (GroupNamespace, SharedState) {
        let state = SharedState::new(EntityState::default());
        (store.namespace(state.clone()), state)
    }

    #[test]
    fn test_private_values_move_to_leader() {
        let store = GroupStore::new();
        let (group, state) = namespace(&store);

        group.set("target", Value::Int(7));
        group.set("mode", Value::from("pull"));
        assert_eq!(group.resolve(), group.private_id());

        state.set_leader_id(Some(42));
        assert_eq!(group.resolve(), GroupId::Leader(42));
        assert_eq!(group.get("target", Value::Nil), Value::Int(7));
        assert_eq!(group.get("mode", Value::Nil), Value::from("pull"));
        assert!(store.bucket(group.private_id()).is_empty());
        assert_eq!(store.bucket(GroupId::Leader(42)).len(), 2);
    }

    #[test]
    fn test_private_values_overwrite_leader_values() {
        let store = GroupStore::new();
        let (leader_view, leader_state) = namespace(&store);
        leader_state.set_leader_id(Some(1));
        leader_view.set("x", Value::Int(1));

        let (member, member_state) = namespace(&store);
        member.set("x", Value::Int(2));
        member_state.set_leader_id(Some(1));

        assert_eq!(leader_view.get("x", Value::Nil), Value::Int(1));
        assert_eq!(member.get("x", Value::Nil), Value::Int(2));
        assert_eq!(leader_view.get("x", Value::Nil), Value::Int(2));
    }

    #[test]
    fn test_members_share_leader_bucket() {
        let store = GroupStore::new();
        let (a, a_state) = namespace(&store);
        let (b, b_state) = namespace(&store);
        a_state.set_leader_id(Some(9));
        b_state.set_leader_id(Some(9));

        a.set("ready", Value::Bool(true));
        assert_eq!(b.get("ready", Value::Bool(false)), Value::Bool(true));
        assert_ne!(a.private_id(), b.private_id());
    }

    #[test]
    fn test_delete_drops_empty_bucket() {
        let store = GroupStore::new();
        let (group, _) = namespace(&store);

        group.set("a", Value::Int(1));
        group.set("b", Value::Int(2));
        assert!(group.delete("a"));
        assert!(!group.delete("a"));
        assert_eq!(store.bucket_count(), 1);

        assert!(group.delete("b"));
        assert_eq!(store.bucket_count(), 0);
        assert_eq!(group.get("b", Value::from("none")), Value::from("none"));
    }

    #[test]
    fn test_subgroups_share_within_party_only() {
        let store = GroupStore::new();
        let (a, a_state) = namespace(&store);
        let (b, b_state) = namespace(&store);
        let (c, c_state) = namespace(&store);
        for state in [&a_state, &b_state, &c_state] {
            state.set_leader_id(Some(7));
        }
        a_state.set_subgroup_index(Some(1));
        b_state.set_subgroup_index(Some(1));
        c_state.set_subgroup_index(Some(2));

        a.subgroup_set("pulled", &Value::Int(3)).unwrap();
        c.subgroup_set("pulled", &Value::from(" 9 ")).unwrap();
        assert_eq!(b.subgroup_get("pulled", 0), Ok(3));
        assert_eq!(c.subgroup_get("pulled", 0), Ok(9));
        assert_eq!(c.subgroup_get("missing", -1), Ok(-1));
        assert_eq!(store.subgroup_count(7), 2);

        assert_eq!(
            a.subgroup_set("mode", &Value::from("pull")),
            Err(SubgroupError::NotAnInteger("\"pull\"".to_string()))
        );

        assert_eq!(b.subgroup_delete("pulled"), Ok(true));
        assert_eq!(a.subgroup_delete("pulled"), Ok(false));
        assert_eq!(store.subgroup_count(7), 1);

        a.clear_subgroups();
        assert_eq!(store.subgroup_count(7), 0);
    }

    #[test]
    fn test_subgroups_need_leader_and_index() {
        let store = GroupStore::new();
        let (group, state) = namespace(&store);
        assert_eq!(group.subgroup_get("x", 0), Err(SubgroupError::NoGroup));

        state.set_leader_id(Some(7));
        assert_eq!(
            group.subgroup_set("x", &Value::Int(1)),
            Err(SubgroupError::NoSubgroup)
        );

        state.set_subgroup_index(Some(0));
        assert_eq!(group.subgroup_delete("x"), Err(SubgroupError::NoSubgroup));
    }

    #[test]
    fn test_clear_drops_current_bucket_only() {
        let store = GroupStore::new();
        let (a, a_state) = namespace(&store);
        let (b, _) = namespace(&store);
        a_state.set_leader_id(Some(3));
        a.set("x", Value::Int(1));
        b.set("y", Value::Int(1));

        a.clear();
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(b.get("y", Value::Nil), Value::Int(1));
    }
}
