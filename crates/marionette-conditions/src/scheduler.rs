use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use marionette_events::ConditionKind;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::registry::ConditionId;

/// Resolves once the stop flag is raised
pub async fn stopped(mut stop_rx: watch::Receiver<bool>) {
    // A dropped sender means the engine is gone; treat it as stopped
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

struct PeriodicTask {
    handle: AbortHandle,
    source: String,
}

/// What the supervisor needs to know about a periodic condition's task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicStatus {
    pub source: String,
    pub finished: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cooperative executor front-end for one entity.
///
/// Every task runs on the entity's runtime and is dropped at its next
/// suspension point once the stop flag is raised or its handle is aborted.
pub struct Scheduler {
    runtime: Handle,
    stop_tx: watch::Sender<bool>,
    periodic: Mutex<HashMap<ConditionId, PeriodicTask>>,
    running: Mutex<HashMap<(ConditionKind, String), usize>>,
    tasks: Mutex<Vec<AbortHandle>>,
    supervisor: Mutex<Option<AbortHandle>>,
}

impl Scheduler {
    /// A scheduler that starts out stopped
    pub fn new(runtime: Handle) -> Self {
        let (stop_tx, _) = watch::channel(true);
        Self {
            runtime,
            stop_tx,
            periodic: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stop_tx.send_replace(stopped);
    }

    fn spawn_stoppable<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop_rx = self.stop_signal();
        self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = stopped(stop_rx) => {}
                _ = task => {}
            }
        })
    }

    /// Spawn `task`, abandoning it when the stop flag is raised or
    /// [`Scheduler::abort_all`] is called
    pub fn spawn<F>(&self, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let join = self.spawn_stoppable(task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(join.abort_handle());
        join.abort_handle()
    }

    /// Abort every task started with [`Scheduler::spawn`]
    pub fn abort_all(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    /// Tasks started with [`Scheduler::spawn`] that have not finished
    pub fn active_tasks(&self) -> usize {
        lock(&self.tasks)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Run `task` as the supervisor, replacing any previous one
    pub fn start_supervisor<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.spawn_stoppable(task).abort_handle();
        if let Some(previous) = lock(&self.supervisor).replace(handle) {
            previous.abort();
        }
    }

    pub fn supervisor_running(&self) -> bool {
        lock(&self.supervisor)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel_supervisor(&self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }

    pub fn track_periodic(&self, id: ConditionId, source: &str, handle: AbortHandle) {
        let task = PeriodicTask {
            handle,
            source: source.to_string(),
        };
        if let Some(previous) = lock(&self.periodic).insert(id, task) {
            previous.handle.abort();
        }
    }

    pub fn periodic_status(&self, id: ConditionId) -> Option<PeriodicStatus> {
        lock(&self.periodic).get(&id).map(|task| PeriodicStatus {
            source: task.source.clone(),
            finished: task.handle.is_finished(),
        })
    }

    /// Cancel the supervising task of `id`, returning whether one existed
    pub fn cancel_periodic(&self, id: ConditionId) -> bool {
        match lock(&self.periodic).remove(&id) {
            Some(task) => {
                task.handle.abort();
                debug!(target: "scheduler", "Cancelled periodic task {}", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every periodic task whose condition fails `keep`
    pub fn retain_periodic(&self, keep: impl Fn(ConditionId) -> bool) {
        lock(&self.periodic).retain(|id, task| {
            let kept = keep(*id);
            if !kept {
                task.handle.abort();
            }
            kept
        });
    }

    pub fn cancel_all_periodic(&self) {
        for (_, task) in lock(&self.periodic).drain() {
            task.handle.abort();
        }
    }

    /// Periodic tasks that have not finished
    pub fn live_periodic(&self) -> usize {
        lock(&self.periodic)
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Mark one execution of `(kind, name)` as in flight until the guard drops
    pub fn begin(&self, kind: ConditionKind, name: &str) -> RunningGuard<'_> {
        *lock(&self.running)
            .entry((kind, name.to_string()))
            .or_insert(0) += 1;
        RunningGuard {
            scheduler: self,
            key: (kind, name.to_string()),
        }
    }

    pub fn is_running(&self, kind: ConditionKind, name: &str) -> bool {
        lock(&self.running).contains_key(&(kind, name.to_string()))
    }

    pub fn running_count(&self) -> usize {
        lock(&self.running).values().sum()
    }

    pub fn clear_running(&self) {
        lock(&self.running).clear();
    }
}

pub struct RunningGuard<'a> {
    scheduler: &'a Scheduler,
    key: (ConditionKind, String),
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut running = lock(&self.scheduler.running);
        if let Some(count) = running.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                running.remove(&self.key);
            }
        }
    }
}
