use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use concurrent_queue::ConcurrentQueue;

use crate::config::Config;
use crate::core::Core;
use crate::token::ConnHandle;
use wake::Wake;

/// A blocking, one-unit-per-post wakeup, used so a worker parked waiting on
/// an empty queue consumes exactly one `defer` and never steals a wakeup
/// meant for a sibling worker. On Linux this is a semaphore-mode `eventfd`
/// (the original design's self-pipe, one byte per wakeup, made native); on
/// other Unixes it's a real self-pipe, read one byte at a time.
#[cfg(target_os = "linux")]
mod wake {
    use crate::sys::eventfd::{EventFd, EFD_CLOEXEC, EFD_SEMAPHORE};

    pub struct Wake(EventFd);

    impl Wake {
        pub fn new() -> std::io::Result<Wake> {
            Ok(Wake(EventFd::with_options(0, EFD_CLOEXEC | EFD_SEMAPHORE)?))
        }

        pub fn post(&self) {
            let _ = self.0.write(1);
        }

        /// Blocks until at least one posted unit is available, consuming
        /// exactly one.
        pub fn wait_one(&self) {
            let _ = self.0.read();
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod wake {
    use std::io::{Read, Write};

    use crate::sys::fd::FileDesc;

    pub struct Wake {
        read_fd: FileDesc,
        write_fd: FileDesc,
    }

    impl Wake {
        pub fn new() -> std::io::Result<Wake> {
            let mut fds = [0; 2];
            crate::syscall!(pipe(fds.as_mut_ptr()))?;
            let read_fd = unsafe { FileDesc::new(fds[0]) };
            let write_fd = unsafe { FileDesc::new(fds[1]) };
            read_fd.set_cloexec()?;
            write_fd.set_cloexec()?;
            Ok(Wake { read_fd, write_fd })
        }

        pub fn post(&self) {
            let _ = (&self.write_fd).write(&[1u8]);
        }

        pub fn wait_one(&self) {
            let mut byte = [0u8; 1];
            let _ = (&self.read_fd).read_exact(&mut byte);
        }
    }
}

pub(crate) enum Task {
    Global(Box<dyn FnOnce(&Core) + Send>),
    PerConnection {
        handle: ConnHandle,
        body: Box<dyn FnOnce(&Core, ConnHandle) + Send>,
        fallback: Option<Box<dyn FnOnce(&Core, ConnHandle) + Send>>,
    },
    Broadcast {
        origin: Option<ConnHandle>,
        service_tag: String,
        body: Arc<dyn Fn(&Core, ConnHandle) + Send + Sync>,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
        cursor: usize,
    },
}

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
}

/// Fixed-size thread pool consuming a single MPMC task queue.
///
/// Workers block in a semaphore-mode `eventfd` read when the queue is empty
/// — the direct analog of the original design's self-pipe, one wakeup unit
/// per `defer`. `worker_sentinel` replaces the original's SIGSEGV-catching
/// sentinel threads (no safe-Rust equivalent) with `catch_unwind` around
/// every task body plus a supervisor that respawns a worker whose thread
/// has actually died.
pub struct Dispatcher {
    queue: ConcurrentQueue<Task>,
    wake: Wake,
    workers: Mutex<Vec<Worker>>,
    thread_count: usize,
    sentinel: bool,
    running: AtomicBool,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> std::io::Result<Dispatcher> {
        let thread_count = if cfg.dispatcher_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            cfg.dispatcher_threads
        };

        Ok(Dispatcher {
            queue: ConcurrentQueue::unbounded(),
            wake: Wake::new()?,
            workers: Mutex::new(Vec::new()),
            thread_count,
            sentinel: cfg.worker_sentinel,
            running: AtomicBool::new(true),
        })
    }

    pub(crate) fn defer(&self, task: Task) {
        let _ = self.queue.push(task);
        self.wake.post();
    }

    pub fn start(self: &Arc<Self>, core: Weak<Core>) {
        let mut workers = self.workers.lock().unwrap();
        for id in 0..self.thread_count {
            workers.push(self.spawn_worker(id, core.clone()));
        }
    }

    fn spawn_worker(self: &Arc<Self>, id: usize, core: Weak<Core>) -> Worker {
        let dispatcher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("core-worker-{id}"))
            .spawn(move || worker_loop(&dispatcher, &core))
            .expect("spawn dispatcher worker");
        Worker {
            handle: Some(handle),
        }
    }

    /// Detects a worker whose thread has died (a panic that unwound past
    /// `catch_unwind` can only happen if the panic hook itself aborts; this
    /// also covers an allocator abort) and respawns it. Called once per
    /// reactor tick.
    pub fn supervise(self: &Arc<Self>, core: &Weak<Core>) {
        if !self.sentinel {
            return;
        }
        let mut workers = self.workers.lock().unwrap();
        for (id, w) in workers.iter_mut().enumerate() {
            let dead = matches!(&w.handle, Some(h) if h.is_finished());
            if dead {
                if let Some(h) = w.handle.take() {
                    let _ = h.join();
                }
                log::error!(target: "core::dispatcher", "worker {id} died, respawning");
                *w = self.spawn_worker(id, core.clone());
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for _ in 0..self.thread_count {
            self.wake.post();
        }
    }

    pub fn join(&self) {
        let mut workers = self.workers.lock().unwrap();
        for w in workers.iter_mut() {
            if let Some(h) = w.handle.take() {
                let _ = h.join();
            }
        }
    }
}

fn worker_loop(dispatcher: &Arc<Dispatcher>, core: &Weak<Core>) {
    while dispatcher.running.load(Ordering::Acquire) {
        match dispatcher.queue.pop() {
            Ok(task) => {
                let core = match core.upgrade() {
                    Some(c) => c,
                    None => return,
                };
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_task(&core, task, dispatcher)
                }));
                if let Err(payload) = outcome {
                    log::error!(target: "core::dispatcher", "task panicked: {}", panic_message(&payload));
                }
            }
            Err(_) => {
                // Blocks until the next `defer` posts one wakeup unit.
                dispatcher.wake.wait_one();
            }
        }
    }
}

fn run_task(core: &Core, task: Task, dispatcher: &Dispatcher) {
    match task {
        Task::Global(body) => body(core),

        Task::PerConnection {
            handle,
            body,
            fallback,
        } => match core.registry().try_acquire_busy(handle) {
            Ok(true) => {
                body(core, handle);
                core.registry().release_busy(handle);
            }
            Ok(false) => dispatcher.defer(Task::PerConnection {
                handle,
                body,
                fallback,
            }),
            Err(_) => {
                if let Some(fallback) = fallback {
                    fallback(core, handle);
                }
            }
        },

        Task::Broadcast {
            origin,
            service_tag,
            body,
            on_finish,
            cursor,
        } => run_broadcast_step(core, dispatcher, origin, service_tag, body, on_finish, cursor),
    }
}

fn run_broadcast_step(
    core: &Core,
    dispatcher: &Dispatcher,
    origin: Option<ConnHandle>,
    service_tag: String,
    body: Arc<dyn Fn(&Core, ConnHandle) + Send + Sync>,
    on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    mut cursor: usize,
) {
    loop {
        let (handle, next_cursor) = match core.registry().next_in_tag(&service_tag, cursor) {
            Some(found) => found,
            None => {
                if let Some(finish) = on_finish {
                    finish(core);
                }
                return;
            }
        };

        if Some(handle) == origin {
            cursor = next_cursor;
            continue;
        }

        match core.registry().try_acquire_busy(handle) {
            Ok(true) => {
                body(core, handle);
                core.registry().release_busy(handle);
                dispatcher.defer(Task::Broadcast {
                    origin,
                    service_tag,
                    body,
                    on_finish,
                    cursor: next_cursor,
                });
            }
            // Busy or already gone: retry the same cursor position later
            // rather than skipping a connection that was merely busy.
            Ok(false) | Err(_) => dispatcher.defer(Task::Broadcast {
                origin,
                service_tag,
                body,
                on_finish,
                cursor,
            }),
        }
        return;
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
