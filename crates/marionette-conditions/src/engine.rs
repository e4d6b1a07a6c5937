//! The condition engine of one controlled entity.
//!
//! `ConditionEngine` is the surface the editor, the runner and tests use. It
//! owns the registry and everything that executes it: compile cache,
//! scheduler, periodic supervisor, walk coordinator and group namespace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use marionette_client::config::{EngineConfig, WalkConfig};
use marionette_client::{CachedMapLoader, EntityState, GameApi, MapLoader, Pathfinder, SharedState};
use marionette_events::{
    ConditionEvent, ConditionKind, EventSender, EventSource, EventType, PacketEvent,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::blocking::BlockingPool;
use crate::cache::CompileCache;
use crate::control::{apply_control, ActivityClock, ControlOp, Toggle};
use crate::dispatcher::{self, source_listing};
use crate::error::{
    BuildError, CompileError, ControlError, EngineError, RegistryError, ScriptError,
};
use crate::group::{GroupNamespace, GroupStore};
use crate::host::ExecutionContext;
use crate::persist::{self, ConditionFile};
use crate::registry::{Condition, ConditionId, ConditionRegistry, SequenceEntry};
use crate::scheduler::Scheduler;
use crate::script::Value;
use crate::walk::{WalkCoordinator, WalkDeps};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared state behind every handle to one engine
pub(crate) struct EngineCore {
    pub(crate) name: String,
    pub(crate) config: EngineConfig,
    pub(crate) registry: Mutex<ConditionRegistry>,
    pub(crate) cache: CompileCache,
    pub(crate) scheduler: Scheduler,
    pub(crate) clock: Mutex<ActivityClock>,
    pub(crate) attrs: Mutex<HashMap<String, Value>>,
    pub(crate) group: GroupNamespace,
    pub(crate) state: SharedState,
    pub(crate) api: Arc<dyn GameApi>,
    pub(crate) walker: WalkCoordinator,
    pub(crate) blocking: BlockingPool,
    events: EventSender,
    /// Last error signature logged per condition
    reported: Mutex<HashMap<(ConditionKind, String), String>>,
}

impl EngineCore {
    pub(crate) fn publish(&self, event: ConditionEvent) {
        self.events
            .emit(EventType::Condition(event), EventSource::Engine);
    }

    /// Whether `message` for `source` differs from the last error logged for
    /// the condition
    fn first_report(&self, kind: ConditionKind, name: &str, message: &str, source: &str) -> bool {
        let signature = format!("{}\n{}", message, source);
        let previous = lock(&self.reported).insert((kind, name.to_string()), signature.clone());
        previous.as_deref() != Some(signature.as_str())
    }

    /// Let the next error of the condition be logged again
    pub(crate) fn forget_report(&self, kind: ConditionKind, name: &str) {
        lock(&self.reported).remove(&(kind, name.to_string()));
    }

    /// Interval of an active periodic condition, `None` once it is inactive or gone
    pub(crate) fn periodic_interval(&self, id: ConditionId) -> Option<f64> {
        lock(&self.registry)
            .find_by_id(id)
            .filter(|c| c.active)
            .map(|c| c.interval.unwrap_or(self.config.default_interval))
    }

    /// Apply a `cond.on` / `cond.off` assignment made by `current`
    pub(crate) fn control(
        &self,
        op: ControlOp,
        value: &Value,
        current: Option<ConditionId>,
    ) -> Result<Vec<Toggle>, ControlError> {
        let toggled = apply_control(&mut lock(&self.registry), op, value, current)?;
        self.after_toggles(&toggled);
        Ok(toggled)
    }

    fn after_toggles(&self, toggled: &[Toggle]) {
        if toggled.is_empty() {
            return;
        }
        {
            let mut clock = lock(&self.clock);
            clock.record_state_change();
            for toggle in toggled {
                clock.record_activity(toggle.kind, &toggle.name);
            }
        }
        for toggle in toggled {
            if !toggle.active && toggle.kind == ConditionKind::Periodic {
                self.scheduler.cancel_periodic(toggle.id);
            }
            info!(
                target: "conditions",
                entity = %self.name,
                "{} condition '{}' {}",
                toggle.kind,
                toggle.name,
                if toggle.active { "activated" } else { "deactivated" }
            );
            self.publish(ConditionEvent::Toggled {
                kind: toggle.kind,
                name: toggle.name.clone(),
                active: toggle.active,
            });
        }
    }

    /// Remove a condition whose execution failed. Overlapping failures of the
    /// same condition remove and log it once.
    pub(crate) fn remove_after_error(&self, ctx: &ExecutionContext, error: &ScriptError, source: &str) {
        if lock(&self.registry).remove_by_id(ctx.id).is_none() {
            return;
        }
        if ctx.kind == ConditionKind::Periodic {
            self.scheduler.cancel_periodic(ctx.id);
        }
        self.cache.evict(ctx.kind, &ctx.name);

        let message = error.to_string();
        if self.first_report(ctx.kind, &ctx.name, &message, source) {
            error!(
                target: "conditions",
                entity = %self.name,
                "Error executing {} condition: {}\n{}\nError: {}\nCondition was removed.",
                ctx.kind,
                ctx.name,
                source_listing(source, error.line()),
                message
            );
        }
        self.publish(ConditionEvent::Removed {
            kind: ctx.kind,
            name: ctx.name.clone(),
            error: Some(message),
        });
    }

    /// A packet condition that does not compile is removed
    pub(crate) fn remove_after_compile_error(&self, condition: &Condition, error: &CompileError) {
        if lock(&self.registry).remove_by_id(condition.id).is_none() {
            return;
        }
        self.cache.evict(condition.kind, &condition.name);
        self.log_compile_error(condition, error);
        self.publish(ConditionEvent::Removed {
            kind: condition.kind,
            name: condition.name.clone(),
            error: Some(error.to_string()),
        });
    }

    /// A periodic condition that does not compile stays registered without a task
    pub(crate) fn record_compile_error(&self, condition: &Condition, error: &CompileError) {
        let message = error.to_string();
        if condition.last_error.as_deref() != Some(message.as_str()) {
            lock(&self.registry).set_last_error(condition.id, Some(message));
        }
        self.log_compile_error(condition, error);
    }

    fn log_compile_error(&self, condition: &Condition, error: &CompileError) {
        let message = error.to_string();
        if !self.first_report(condition.kind, &condition.name, &message, &condition.source) {
            return;
        }
        error!(
            target: "conditions",
            entity = %self.name,
            "Failed to compile {} condition: {}\n{}\nError: {}",
            condition.kind,
            condition.name,
            source_listing(&condition.source, error.line()),
            message
        );
        self.publish(ConditionEvent::CompileFailed {
            kind: condition.kind,
            name: condition.name.clone(),
            message,
        });
    }
}

/// Configures and creates a [`ConditionEngine`]
pub struct ConditionEngineBuilder {
    name: String,
    engine_config: EngineConfig,
    walk_config: WalkConfig,
    api: Option<Arc<dyn GameApi>>,
    pathfinder: Option<Arc<dyn Pathfinder>>,
    map_loader: Option<Box<dyn MapLoader>>,
    state: Option<SharedState>,
    group_store: Option<GroupStore>,
    events: Option<EventSender>,
    runtime: Option<Handle>,
}

impl ConditionEngineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_config: EngineConfig::default(),
            walk_config: WalkConfig::default(),
            api: None,
            pathfinder: None,
            map_loader: None,
            state: None,
            group_store: None,
            events: None,
            runtime: None,
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

    pub fn with_api(mut self, api: Arc<dyn GameApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_pathfinder(mut self, pathfinder: Arc<dyn Pathfinder>) -> Self {
        self.pathfinder = Some(pathfinder);
        self
    }

    pub fn with_map_loader(mut self, loader: Box<dyn MapLoader>) -> Self {
        self.map_loader = Some(loader);
        self
    }

    /// Entity state to read from; a fresh one is created otherwise
    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = Some(state);
        self
    }

    /// Group storage shared with other entities; a private one is created otherwise
    pub fn with_group_store(mut self, store: GroupStore) -> Self {
        self.group_store = Some(store);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Runtime the entity's tasks run on; defaults to the current one
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ConditionEngine, BuildError> {
        let api = self.api.ok_or(BuildError::MissingApi)?;
        let pathfinder = self.pathfinder.ok_or(BuildError::MissingPathfinder)?;
        let map_loader = self.map_loader.ok_or(BuildError::MissingMapLoader)?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| BuildError::MissingRuntime)?,
        };

        let state = self
            .state
            .unwrap_or_else(|| SharedState::new(EntityState::default()));
        let group = self
            .group_store
            .unwrap_or_default()
            .namespace(state.clone());
        let events = self.events.unwrap_or_else(|| EventSender::detached(0));

        let scheduler = Scheduler::new(runtime);
        let walker = WalkCoordinator::new(
            self.walk_config,
            WalkDeps {
                api: Arc::clone(&api),
                state: state.clone(),
                pathfinder,
                maps: Arc::new(CachedMapLoader::new(map_loader)),
            },
            BlockingPool::new("path", self.engine_config.path_workers),
            &scheduler,
        );
        let blocking = BlockingPool::new("blocking", self.engine_config.blocking_workers);

        debug!(target: "conditions", entity = %self.name, "Condition engine created");
        Ok(ConditionEngine {
            core: Arc::new(EngineCore {
                name: self.name,
                config: self.engine_config,
                registry: Mutex::new(ConditionRegistry::new()),
                cache: CompileCache::new(),
                scheduler,
                clock: Mutex::new(ActivityClock::new()),
                attrs: Mutex::new(HashMap::new()),
                group,
                state,
                api,
                walker,
                blocking,
                events,
                reported: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Handle to one entity's condition engine. Clones share the engine.
#[derive(Clone)]
pub struct ConditionEngine {
    core: Arc<EngineCore>,
}

impl ConditionEngine {
    pub fn builder(name: impl Into<String>) -> ConditionEngineBuilder {
        ConditionEngineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> &SharedState {
        &self.core.state
    }

    pub fn group(&self) -> &GroupNamespace {
        &self.core.group
    }

    pub fn walker(&self) -> &WalkCoordinator {
        &self.core.walker
    }

    /// Register a condition after checking that its source compiles.
    ///
    /// Periodic conditions get the configured default interval.
    pub fn add_condition(
        &self,
        kind: ConditionKind,
        name: &str,
        source: &str,
        active: bool,
    ) -> Result<ConditionId, EngineError> {
        let interval = (kind == ConditionKind::Periodic).then_some(self.core.config.default_interval);
        self.insert(kind, name, source, active, interval, true)
    }

    pub fn add_periodic(
        &self,
        name: &str,
        source: &str,
        active: bool,
        interval: f64,
    ) -> Result<ConditionId, EngineError> {
        self.insert(ConditionKind::Periodic, name, source, active, Some(interval), true)
    }

    fn insert(
        &self,
        kind: ConditionKind,
        name: &str,
        source: &str,
        active: bool,
        interval: Option<f64>,
        validate: bool,
    ) -> Result<ConditionId, EngineError> {
        let id = {
            let mut registry = lock(&self.core.registry);
            if registry.find(kind, name).is_some() {
                return Err(RegistryError::DuplicateName {
                    kind,
                    name: name.to_string(),
                }
                .into());
            }
            if validate {
                self.core
                    .cache
                    .get_or_compile(kind, name, source)
                    .map_err(|source| EngineError::Compile {
                        kind,
                        name: name.to_string(),
                        source,
                    })?;
            }
            match interval {
                Some(interval) => registry.add_periodic(name, source, active, interval)?,
                None => registry.add(kind, name, source, active)?,
            }
        };
        self.core.forget_report(kind, name);

        info!(target: "conditions", entity = %self.core.name, "Added {} condition '{}'", kind, name);
        self.core.publish(ConditionEvent::Added {
            kind,
            name: name.to_string(),
        });
        Ok(id)
    }

    /// Remove the condition at `index` of `kind`, cancelling its task
    pub fn remove(&self, kind: ConditionKind, index: usize) -> Result<Condition, EngineError> {
        let removed = lock(&self.core.registry).remove(kind, index)?;
        if kind == ConditionKind::Periodic {
            self.core.scheduler.cancel_periodic(removed.id);
        }
        info!(target: "conditions", entity = %self.core.name, "Removed {} condition '{}'", kind, removed.name);
        self.core.publish(ConditionEvent::Removed {
            kind,
            name: removed.name.clone(),
            error: None,
        });
        Ok(removed)
    }

    /// Set the activation flag, returning whether it changed.
    ///
    /// Deactivating a periodic condition cancels its task immediately.
    pub fn set_active(
        &self,
        kind: ConditionKind,
        index: usize,
        active: bool,
    ) -> Result<bool, EngineError> {
        let toggle = {
            let mut registry = lock(&self.core.registry);
            let changed = registry.set_active(kind, index, active)?;
            registry
                .get(kind, index)
                .filter(|_| changed)
                .map(|c| Toggle {
                    id: c.id,
                    kind,
                    name: c.name.clone(),
                    active,
                })
        };
        let changed = toggle.is_some();
        self.core.after_toggles(toggle.as_slice());
        Ok(changed)
    }

    /// Replace a condition's source once the new text compiles
    pub fn update_source(
        &self,
        kind: ConditionKind,
        index: usize,
        source: &str,
    ) -> Result<(), EngineError> {
        let mut registry = lock(&self.core.registry);
        let name = registry
            .get(kind, index)
            .map(|c| c.name.clone())
            .ok_or(RegistryError::IndexOutOfRange {
                kind,
                index,
                len: registry.list(kind).len(),
            })?;
        self.core
            .cache
            .get_or_compile(kind, &name, source)
            .map_err(|source| EngineError::Compile {
                kind,
                name: name.clone(),
                source,
            })?;
        registry.set_source(kind, index, source)?;
        Ok(())
    }

    pub fn set_interval(&self, index: usize, interval: f64) -> Result<(), EngineError> {
        lock(&self.core.registry).set_interval(index, interval)?;
        Ok(())
    }

    pub fn conditions(&self, kind: ConditionKind) -> Vec<Condition> {
        lock(&self.core.registry).list(kind).to_vec()
    }

    pub fn find(&self, kind: ConditionKind, name: &str) -> Option<Condition> {
        lock(&self.core.registry)
            .find(kind, name)
            .map(|(_, c)| c.clone())
    }

    pub fn sequence_index(&self) -> Vec<SequenceEntry> {
        lock(&self.core.registry).sequence_index()
    }

    /// Apply `cond.on` / `cond.off` from outside any condition
    pub fn control(&self, op: ControlOp, value: &Value) -> Result<Vec<Toggle>, ControlError> {
        self.core.control(op, value, None)
    }

    /// Schedule every active condition bound to the packet's direction.
    ///
    /// Returns the number of executions started.
    pub fn dispatch_packet(&self, packet: &PacketEvent) -> usize {
        dispatcher::dispatch_packet(&self.core, packet)
    }

    /// Clear the stop flag and start supervising periodic conditions
    pub fn start(&self) {
        self.core.scheduler.set_stopped(false);
        self.core
            .scheduler
            .start_supervisor(dispatcher::run_supervisor(Arc::clone(&self.core)));
        info!(target: "conditions", entity = %self.core.name, "Condition engine started");
    }

    /// Raise the stop flag; every running unit is abandoned at its next
    /// suspension point
    pub fn stop(&self) {
        self.core.scheduler.set_stopped(true);
        self.core.scheduler.cancel_supervisor();
        self.core.scheduler.cancel_all_periodic();
        info!(target: "conditions", entity = %self.core.name, "Condition engine stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.core.scheduler.is_stopped()
    }

    /// Cancel everything and forget every condition, e.g. when the group is
    /// reconfigured
    pub fn reset(&self) {
        let core = &self.core;
        core.scheduler.cancel_all_periodic();
        core.scheduler.abort_all();
        lock(&core.registry).clear();
        core.cache.clear();
        core.scheduler.clear_running();
        lock(&core.clock).clear();
        lock(&core.reported).clear();
        core.walker.clear();
        core.group.clear_subgroups();
        core.group.clear();
        info!(target: "conditions", entity = %core.name, "Condition engine reset");
    }

    pub fn is_running(&self, kind: ConditionKind, name: &str) -> bool {
        self.core.scheduler.is_running(kind, name)
    }

    /// Executions currently in flight
    pub fn running_count(&self) -> usize {
        self.core.scheduler.running_count()
    }

    /// Periodic conditions with a live supervising task
    pub fn live_periodic(&self) -> usize {
        self.core.scheduler.live_periodic()
    }

    pub fn time_since_last_change(&self) -> Duration {
        lock(&self.core.clock).elapsed(None).unwrap_or_default()
    }

    pub fn time_since_activity(&self, kind: ConditionKind, name: &str) -> Option<Duration> {
        lock(&self.core.clock).elapsed(Some((kind, name)))
    }

    /// Successful compilations since the engine was created
    pub fn compile_count(&self) -> u64 {
        self.core.cache.compile_count()
    }

    pub fn attr(&self, name: &str) -> Value {
        lock(&self.core.attrs)
            .get(name)
            .cloned()
            .unwrap_or(Value::Int(0))
    }

    pub fn set_attr(&self, name: &str, value: Value) {
        lock(&self.core.attrs).insert(name.to_string(), value);
    }

    pub fn reset_attrs(&self) {
        lock(&self.core.attrs).clear();
    }

    /// Register every condition file in `dir`, in natural name order.
    ///
    /// Sources are compiled when first scheduled, so a saved condition that
    /// does not compile is still registered. Unreadable files and duplicate
    /// names are logged and skipped. Returns how many conditions were added.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let mut added = 0;
        for loaded in persist::read_dir(dir)? {
            let named = match loaded {
                Ok(named) => named,
                Err(e) => {
                    warn!(target: "conditions", entity = %self.core.name, "Skipping condition file: {}", e);
                    continue;
                }
            };
            let file = named.file;
            let interval =
                (file.kind == ConditionKind::Periodic).then_some(self.core.config.default_interval);
            match self.insert(file.kind, &named.name, &file.source, file.active, interval, false) {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!(target: "conditions", entity = %self.core.name, "Skipping condition '{}': {}", named.name, e)
                }
            }
        }
        info!(
            target: "conditions",
            entity = %self.core.name,
            "Loaded {} condition(s) from {}",
            added,
            dir.display()
        );
        Ok(added)
    }

    /// Write every condition to `dir` as `<name>.txt`
    pub fn export_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
        let conditions: Vec<Condition> = ConditionKind::ALL
            .into_iter()
            .flat_map(|kind| self.conditions(kind))
            .collect();
        let mut written = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let file = ConditionFile::new(condition.kind, condition.active, condition.source);
            written.push(persist::write_file(dir, &condition.name, &file)?);
        }
        Ok(written)
    }
}
