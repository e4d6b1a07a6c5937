use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use marionette_events::ConditionKind;

use crate::error::CompileError;
use crate::script::{CompiledUnit, Compiler};

type CacheKey = (ConditionKind, String);

#[derive(Default)]
struct CacheState {
    units: HashMap<CacheKey, CompiledUnit>,
    /// Last failing source per key, so a broken condition is not recompiled every pass
    failures: HashMap<CacheKey, (String, CompileError)>,
}

/// Compiled units keyed by `(kind, name)`, recompiled only when the source text changes
#[derive(Default)]
pub struct CompileCache {
    compiler: Compiler,
    state: Mutex<CacheState>,
}

impl CompileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached unit for `(kind, name)` if it was built from `source`,
    /// compiling otherwise.
    ///
    /// A failed compilation leaves any previously cached unit in place.
    pub fn get_or_compile(
        &self,
        kind: ConditionKind,
        name: &str,
        source: &str,
    ) -> Result<CompiledUnit, CompileError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (kind, name.to_string());

        if let Some(unit) = state.units.get(&key) {
            if unit.source() == source {
                return Ok(unit.clone());
            }
        }
        if let Some((failed, error)) = state.failures.get(&key) {
            if failed == source {
                return Err(error.clone());
            }
        }

        match self.compiler.compile(source, kind.into()) {
            Ok(unit) => {
                state.failures.remove(&key);
                state.units.insert(key, unit.clone());
                Ok(unit)
            }
            Err(error) => {
                state
                    .failures
                    .insert(key, (source.to_string(), error.clone()));
                Err(error)
            }
        }
    }

    pub fn contains(&self, kind: ConditionKind, name: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .units
            .contains_key(&(kind, name.to_string()))
    }

    pub fn evict(&self, kind: ConditionKind, name: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (kind, name.to_string());
        state.units.remove(&key);
        state.failures.remove(&key);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.units.clear();
        state.failures.clear();
    }

    /// Successful compilations since creation
    pub fn compile_count(&self) -> u64 {
        self.compiler.compile_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_source_is_not_recompiled() {
        let cache = CompileCache::new();
        let first = cache
            .get_or_compile(ConditionKind::Periodic, "p", "x = 1;")
            .unwrap();
        let again = cache
            .get_or_compile(ConditionKind::Periodic, "p", &String::from("x = 1;"))
            .unwrap();

        assert_eq!(first.serial(), again.serial());
        assert_eq!(cache.compile_count(), 1);

        cache
            .get_or_compile(ConditionKind::Periodic, "p", "x = 2;")
            .unwrap();
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn test_same_name_in_other_kind_is_separate() {
        let cache = CompileCache::new();
        let recv = cache
            .get_or_compile(ConditionKind::RecvPacket, "a", "x = 1;")
            .unwrap();
        let send = cache
            .get_or_compile(ConditionKind::SendPacket, "a", "x = 1;")
            .unwrap();
        assert_ne!(recv.serial(), send.serial());
    }

    #[test]
    fn test_failure_keeps_previous_unit() {
        let cache = CompileCache::new();
        let good = cache
            .get_or_compile(ConditionKind::Periodic, "p", "x = 1;")
            .unwrap();

        assert!(cache
            .get_or_compile(ConditionKind::Periodic, "p", "x = ;")
            .is_err());
        assert!(cache
            .get_or_compile(ConditionKind::Periodic, "p", "x = ;")
            .is_err());
        assert_eq!(cache.compile_count(), 1);

        let restored = cache
            .get_or_compile(ConditionKind::Periodic, "p", "x = 1;")
            .unwrap();
        assert_eq!(good.serial(), restored.serial());
    }

    #[test]
    fn test_evict() {
        let cache = CompileCache::new();
        cache
            .get_or_compile(ConditionKind::RecvPacket, "a", "x = 1;")
            .unwrap();
        assert!(cache.contains(ConditionKind::RecvPacket, "a"));

        cache.evict(ConditionKind::RecvPacket, "a");
        assert!(!cache.contains(ConditionKind::RecvPacket, "a"));

        cache
            .get_or_compile(ConditionKind::RecvPacket, "a", "x = 1;")
            .unwrap();
        assert_eq!(cache.compile_count(), 2);
    }
}
