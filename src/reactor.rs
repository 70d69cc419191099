//! The single-threaded event loop. One `Reactor` per process: it owns the
//! only `Demux::wait` call site, and hands every callback off to the
//! dispatcher's worker pool rather than running user code itself.

use std::sync::Arc;

use crate::core::Core;
use crate::demux::Events;
use crate::dispatcher::Task;
use crate::ready::Ready;
use crate::token::{ConnHandle, Token};

pub fn run(core: Arc<Core>) {
    run_with_hooks(core, None, None, None)
}

/// `run`, plus the three process-lifecycle hooks threaded through
/// `Server::run_with`. All three are optional; `run` is just this with all
/// three absent.
pub fn run_with_hooks(
    core: Arc<Core>,
    on_init: Option<Box<dyn FnOnce(&Core) + Send>>,
    mut on_idle: Option<Box<dyn FnMut(&Core) + Send>>,
    on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
) {
    if let Some(init) = on_init {
        init(&core);
    }

    let mut events = Events::with_capacity(core.config().demux_batch);
    let weak = Arc::downgrade(&core);
    let mut last_sweep = 0u64;
    let sweep_every = core.config().tick_interval.as_secs().max(1);

    while core.is_running() {
        let now = core.record_tick();

        match core.demux().wait(&mut events, Some(core.config().reactor_idle_wait)) {
            Ok(0) => {
                if let Some(idle) = on_idle.as_mut() {
                    idle(&core);
                }
            }
            Ok(_) => {
                for (token, ready) in events.iter() {
                    handle_event(&core, token, ready);
                }
            }
            Err(e) => {
                log::error!(target: "core::reactor", "demux wait failed, stopping: {e}");
                break;
            }
        }

        core.dispatcher().supervise(&weak);

        if now.saturating_sub(last_sweep) >= sweep_every {
            sweep_timeouts(&core, now);
            last_sweep = now;
        }
    }

    graceful_shutdown(&core);
    if let Some(finish) = on_finish {
        finish(&core);
    }
}

fn handle_event(core: &Arc<Core>, token: Token, ready: Ready) {
    let handle = match core.registry().current_handle(token.0) {
        Some(h) => h,
        None => return,
    };

    if ready.is_error() || ready.is_hup() {
        core.force_close(handle);
        return;
    }

    if ready.is_writable() {
        if core.flush(handle).is_ok() {
            let _ = core.with_protocol(handle, |p| p.on_ready(core, handle));
        }
    }

    if ready.is_readable() {
        core.registry().touch(handle, core.last_tick());
        core.dispatcher().defer(Task::PerConnection {
            handle,
            body: Box::new(|core, handle| {
                let _ = core.with_protocol(handle, |p| p.on_data(core, handle));
            }),
            fallback: None,
        });
    }
}

/// Walks every open slot once per `tick_interval`, pinging whichever
/// connection has been idle past its own `set_timeout` (or the global
/// `idle_watchdog` if none was set). The default `Protocol::ping`
/// force-closes; a protocol overriding it gets one last chance to answer.
fn sweep_timeouts(core: &Arc<Core>, now: u64) {
    let watchdog_s = core.config().idle_watchdog.as_secs();

    let mut open = Vec::new();
    core.registry().for_each_open(None, |handle| open.push(handle));

    for handle in open {
        let last = core.registry().last_active(handle).unwrap_or(now);
        let per_conn = core.registry().timeout(handle).unwrap_or(0);
        let effective = if per_conn > 0 { per_conn } else { watchdog_s };

        if effective > 0 && now.saturating_sub(last) >= effective {
            let _ = core.with_protocol(handle, |p| p.ping(core, handle));
        }
    }
}

/// Runs once, after the main loop exits: notifies every open connection,
/// gives queued writes one last chance to drain, then force-closes
/// everything and waits for dispatcher workers to finish in-flight tasks.
fn graceful_shutdown(core: &Arc<Core>) {
    let mut open: Vec<ConnHandle> = Vec::new();
    core.registry().for_each_open(None, |handle| open.push(handle));

    for &handle in &open {
        let _ = core.with_protocol(handle, |p| p.on_shutdown(core, handle));
    }
    for handle in open {
        let _ = core.flush(handle);
        core.force_close(handle);
    }

    core.dispatcher().stop();
    core.dispatcher().join();
}
