use std::io;
use std::thread::JoinHandle;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// A single-threaded runtime on its own OS thread, one per controlled entity.
///
/// Every condition of the entity runs on it; the runtime is dropped, and its
/// remaining tasks with it, on [`EntityExecutor::shutdown`].
pub struct EntityExecutor {
    name: String,
    handle: Handle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EntityExecutor {
    pub fn spawn(name: &str) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread_name = format!("entity-{}", name);
        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;

        debug!(target: "runner", entity = %name, "Executor started");
        Ok(Self {
            name: name.to_string(),
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: "runner", entity = %self.name, "Executor thread panicked");
            } else {
                debug!(target: "runner", entity = %self.name, "Executor stopped");
            }
        }
    }
}

impl Drop for EntityExecutor {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
