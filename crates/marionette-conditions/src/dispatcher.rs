//! Routing of triggers to conditions.
//!
//! Packet triggers spawn one execution per active condition of the matching
//! kind. Periodic conditions are owned by a supervisor that keeps exactly one
//! looping task alive per active condition and restarts it when its source
//! changes.

use std::any::Any;
use std::fmt::Write;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use marionette_events::{ConditionKind, PacketEvent};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::engine::{lock, EngineCore};
use crate::host::{ExecutionContext, ExecutionHost};
use crate::registry::Condition;
use crate::error::ScriptError;
use crate::script::{BoxFuture, CompiledUnit, Interpreter};

/// Schedule every active condition bound to the packet's direction.
///
/// Returns how many executions were started.
pub(crate) fn dispatch_packet(core: &Arc<EngineCore>, packet: &PacketEvent) -> usize {
    if core.scheduler.is_stopped() {
        return 0;
    }
    let kind = ConditionKind::for_direction(packet.direction);
    let conditions = lock(&core.registry).active_of_kind(kind);

    let mut started = 0;
    for condition in conditions {
        match core
            .cache
            .get_or_compile(kind, &condition.name, &condition.source)
        {
            Ok(unit) => {
                let task = run_unit(
                    Arc::clone(core),
                    unit,
                    ExecutionContext::from(&condition),
                    Some(packet.raw.clone()),
                );
                core.scheduler.spawn(async move {
                    task.await;
                });
                started += 1;
            }
            Err(e) => core.remove_after_compile_error(&condition, &e),
        }
    }
    trace!(target: "scheduler", entity = %core.name, "{} {} execution(s) for '{}'", started, kind, packet.raw);
    started
}

/// Execute `unit` once for `ctx`. Returns `false` when the run failed and the
/// condition was removed.
pub(crate) async fn run_unit(
    core: Arc<EngineCore>,
    unit: CompiledUnit,
    ctx: ExecutionContext,
    packet: Option<String>,
) -> bool {
    let _running = core.scheduler.begin(ctx.kind, &ctx.name);
    lock(&core.clock).record_activity(ctx.kind, &ctx.name);

    let host = ExecutionHost::new(Arc::clone(&core), ctx.clone());
    let execution: BoxFuture<'_, Result<(), ScriptError>> =
        Box::pin(Interpreter::run(&unit, &host, packet.as_deref()));
    let result = match CatchPanic::new(execution).await {
        Ok(result) => result,
        Err(message) => Err(ScriptError::Host(format!("condition panicked: {}", message))),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            core.remove_after_error(&ctx, &e, unit.source());
            false
        }
    }
}

/// Resolves to `Err` with the panic message when polling the inner future panics
struct CatchPanic<'a, T> {
    inner: BoxFuture<'a, T>,
}

impl<'a, T> CatchPanic<'a, T> {
    fn new(inner: BoxFuture<'a, T>) -> Self {
        Self { inner }
    }
}

impl<T> Future for CatchPanic<'_, T> {
    type Output = Result<T, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// One supervisor pass over the periodic conditions
pub(crate) fn supervise(core: &Arc<EngineCore>) {
    let periodic: Vec<Condition> = lock(&core.registry)
        .list(ConditionKind::Periodic)
        .to_vec();
    core.scheduler
        .retain_periodic(|id| periodic.iter().any(|c| c.id == id));

    for condition in periodic {
        if !condition.active {
            if core.scheduler.cancel_periodic(condition.id) {
                debug!(target: "scheduler", entity = %core.name, "Cancelled periodic condition '{}'", condition.name);
            }
            if condition.last_error.is_some() {
                lock(&core.registry).set_last_error(condition.id, None);
                core.forget_report(condition.kind, &condition.name);
            }
            continue;
        }

        if let Some(status) = core.scheduler.periodic_status(condition.id) {
            if status.source == condition.source && !status.finished {
                continue;
            }
        }
        core.scheduler.cancel_periodic(condition.id);

        match core.cache.get_or_compile(
            ConditionKind::Periodic,
            &condition.name,
            &condition.source,
        ) {
            Ok(unit) => {
                if condition.last_error.is_some() {
                    lock(&core.registry).set_last_error(condition.id, None);
                    core.forget_report(condition.kind, &condition.name);
                }
                let handle = core.scheduler.spawn(run_periodic(
                    Arc::clone(core),
                    unit,
                    ExecutionContext::from(&condition),
                ));
                core.scheduler
                    .track_periodic(condition.id, &condition.source, handle);
                debug!(target: "scheduler", entity = %core.name, "Started periodic condition '{}'", condition.name);
            }
            Err(e) => core.record_compile_error(&condition, &e),
        }
    }
}

/// Loop `unit` until it fails or its condition is deactivated or removed
async fn run_periodic(core: Arc<EngineCore>, unit: CompiledUnit, ctx: ExecutionContext) {
    while let Some(interval) = core.periodic_interval(ctx.id) {
        if !run_unit(Arc::clone(&core), unit.clone(), ctx.clone(), None).await {
            break;
        }
        let pause = core.config.periodic_pause(interval);
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }
}

/// Run [`supervise`] every supervisor tick until cancelled
pub(crate) async fn run_supervisor(core: Arc<EngineCore>) {
    let mut ticker = tokio::time::interval(core.config.supervisor_tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        supervise(&core);
    }
}

/// Numbered source lines, marking `error_line` with `->`
pub(crate) fn source_listing(source: &str, error_line: Option<usize>) -> String {
    let mut listing = String::new();
    for (i, line) in source.lines().enumerate() {
        let number = i + 1;
        let marker = if Some(number) == error_line { "->" } else { "  " };
        let _ = writeln!(listing, "{} {:>3}: {}", marker, number, line);
    }
    listing.trim_end().to_string()
}
