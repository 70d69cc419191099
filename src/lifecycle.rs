//! Process-level concerns outside the reactor loop itself: ignoring
//! `SIGPIPE` (the engine already treats a write to a dead peer as `EPIPE` on
//! the syscall, never as a signal), and flipping `Core::stop` on `SIGINT`/
//! `SIGTERM` so `Server::run` returns instead of the process dying mid-drain.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

use crate::core::Core;
use crate::error::{CoreError, CoreResult};

/// Forks `processes - 1` additional shared-nothing worker processes. Must
/// run before `Core::new` so no process ever forks with live dispatcher
/// threads. Every forked child returns immediately to build its own `Core`;
/// the original process keeps forking until the count is reached, then
/// reaps the children it spawned.
pub(crate) fn fork_workers(processes: u32) -> io::Result<()> {
    if processes <= 1 {
        return Ok(());
    }

    for _ in 1..processes {
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => return Ok(()),
            _ => {}
        }
    }

    reap_children();
    Ok(())
}

/// Blocks in `waitpid(-1, ..)` on a dedicated thread, reaping each forked
/// worker as it exits. Returns once `ECHILD` reports none remain.
fn reap_children() {
    std::thread::Builder::new()
        .name("core-sigchld-reap".into())
        .spawn(|| loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
            if pid > 0 {
                log::debug!(target: "core::lifecycle", "reaped worker process {pid}");
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        })
        .expect("spawn sigchld reaper");
}

pub fn install(core: &Arc<Core>) -> CoreResult<()> {
    crate::sys::ignore_sigpipe();

    let requested = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&requested)).map_err(CoreError::DemuxFatal)?;
    flag::register(SIGTERM, Arc::clone(&requested)).map_err(CoreError::DemuxFatal)?;

    let core = Arc::clone(core);
    std::thread::Builder::new()
        .name("core-signal-watch".into())
        .spawn(move || {
            while !requested.load(Ordering::Relaxed) {
                if !core.is_running() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            log::info!(target: "core::lifecycle", "shutdown signal received");
            core.stop();
        })
        .map_err(|e| CoreError::DemuxFatal(e))?;

    Ok(())
}
