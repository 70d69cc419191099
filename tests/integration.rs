//! End-to-end scenarios driven over real TCP sockets against a running
//! [`Server`], the way `tokio-rs/mio`'s own `tests/tcp.rs` drives a real
//! `TcpListener`/`TcpStream` pair through a real `Poll` rather than mocking
//! the transport.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use edge_core::core::Core;
use edge_core::token::ConnHandle;
use edge_core::{Config, Protocol, Server};

fn start_server(addr: SocketAddr, factory: impl Fn(&Core) -> Box<dyn Protocol> + Send + Sync + 'static) -> Arc<Server> {
    let server = Arc::new(Server::new(Config::default()).expect("server construction"));
    server.listen(addr, factory).expect("bind");
    let running = Arc::clone(&server);
    thread::spawn(move || running.run());
    server
}

/// Connects with a short retry loop, since the reactor thread needs a moment
/// to start accepting after `thread::spawn`.
fn connect_retrying(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("could not connect to {addr}");
}

struct Echo;

impl Protocol for Echo {
    fn on_data(&mut self, core: &Core, handle: ConnHandle) {
        let mut buf = [0u8; 4096];
        loop {
            match core.read(handle, &mut buf) {
                Ok(edge_core::error::IoOutcome::Done(0)) => {
                    core.force_close(handle);
                    return;
                }
                Ok(edge_core::error::IoOutcome::Done(n)) => {
                    let _ = core.write(handle, buf[..n].to_vec());
                }
                Ok(edge_core::error::IoOutcome::WouldBlock) => return,
                Err(_) => return,
            }
        }
    }
}

#[test]
fn echo_roundtrip() {
    let addr: SocketAddr = "127.0.0.1:18180".parse().unwrap();
    let server = start_server(addr, |_core| Box::new(Echo));

    let mut client = connect_retrying(addr);
    client.write_all(b"hello core").unwrap();

    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello core");

    server.stop();
}

#[test]
fn pipelined_requests_are_each_echoed_in_order() {
    let addr: SocketAddr = "127.0.0.1:18181".parse().unwrap();
    let server = start_server(addr, |_core| Box::new(Echo));

    let mut client = connect_retrying(addr);
    // Three requests written back-to-back before reading anything, so the
    // server's single edge-triggered readiness notification must drain all
    // of them from one `on_data` invocation.
    client.write_all(b"one;two;three;").unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 256];
    while received.len() < b"one;two;three;".len() {
        let n = client.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, b"one;two;three;");

    server.stop();
}

/// Writes a large, slow-to-drain reply followed by a short urgent reply; the
/// urgent bytes must be observed ahead of (what's left of) the large one.
struct UrgentPreempt {
    armed: bool,
}

impl Protocol for UrgentPreempt {
    fn on_data(&mut self, core: &Core, handle: ConnHandle) {
        let mut buf = [0u8; 64];
        match core.read(handle, &mut buf) {
            Ok(edge_core::error::IoOutcome::Done(n)) if n > 0 => {}
            _ => return,
        }
        if !self.armed {
            self.armed = true;
            let big = vec![b'x'; 1_000_000];
            let _ = core.write(handle, big);
            let _ = core.write_urgent(handle, b"URGENT".to_vec());
        }
    }
}

#[test]
fn urgent_write_is_observed_ahead_of_bulk_data() {
    let addr: SocketAddr = "127.0.0.1:18182".parse().unwrap();
    let server = start_server(addr, |_core| Box::new(UrgentPreempt { armed: false }));

    let mut client = connect_retrying(addr);
    client.write_all(b"go").unwrap();

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"URGENT");

    server.stop();
}

struct SendfileOnce {
    path: std::path::PathBuf,
}

impl Protocol for SendfileOnce {
    fn on_data(&mut self, core: &Core, handle: ConnHandle) {
        let mut buf = [0u8; 16];
        match core.read(handle, &mut buf) {
            Ok(edge_core::error::IoOutcome::Done(n)) if n > 0 => {}
            _ => return,
        }
        let file = std::fs::File::open(&self.path).unwrap();
        let len = file.metadata().unwrap().len();
        let _ = core.sendfile(handle, file, 0, len, false);
    }
}

#[test]
fn sendfile_streams_full_file_contents() {
    let addr: SocketAddr = "127.0.0.1:18183".parse().unwrap();

    let mut path = std::env::temp_dir();
    path.push("edge-core-sendfile-test.bin");
    let payload: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let server = start_server(addr, move |_core| {
        Box::new(SendfileOnce { path: path.clone() })
    });

    let mut client = connect_retrying(addr);
    client.write_all(b"go").unwrap();

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 65536];
    while received.len() < payload.len() {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("read failed: {e}"),
        }
    }
    assert_eq!(received, payload);

    server.stop();
}

struct BroadcastEcho;

impl Protocol for BroadcastEcho {
    fn service_tag(&self) -> &str {
        "room"
    }

    fn on_data(&mut self, core: &Core, handle: ConnHandle) {
        let mut buf = [0u8; 256];
        let n = match core.read(handle, &mut buf) {
            Ok(edge_core::error::IoOutcome::Done(n)) if n > 0 => n,
            _ => return,
        };
        let message = buf[..n].to_vec();
        core.each(
            Some(handle),
            "room",
            move |core, peer| {
                let _ = core.write(peer, message.clone());
            },
            None,
        );
    }
}

#[test]
fn broadcast_reaches_every_other_connection_in_the_tag() {
    let addr: SocketAddr = "127.0.0.1:18184".parse().unwrap();
    let server = start_server(addr, |_core| Box::new(BroadcastEcho));

    let mut a = connect_retrying(addr);
    let mut b = connect_retrying(addr);
    // Give both connections time to register before the broadcast fires.
    thread::sleep(Duration::from_millis(50));

    a.write_all(b"hi room").unwrap();

    let mut buf = [0u8; 64];
    let n = b.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi room");

    server.stop();
}

#[test]
fn one_shot_timer_fires_exactly_once() {
    let server = Arc::new(Server::new(Config::default()).expect("server construction"));
    let running = Arc::clone(&server);
    thread::spawn(move || running.run());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = Arc::clone(&fired);
    server
        .run_after(Duration::from_millis(20), move |_core| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("schedule timer");

    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    server.stop();
}

#[test]
fn repeating_timer_stops_after_its_repeat_count_and_calls_on_finish() {
    let server = Arc::new(Server::new(Config::default()).expect("server construction"));
    let running = Arc::clone(&server);
    thread::spawn(move || running.run());

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks_cb = Arc::clone(&ticks);
    let finished = Arc::new(AtomicBool::new(false));
    let finished_cb = Arc::clone(&finished);

    server
        .run_every(
            Duration::from_millis(15),
            3,
            move |_core| {
                ticks_cb.fetch_add(1, Ordering::SeqCst);
            },
            Some(Box::new(move |_core| {
                finished_cb.store(true, Ordering::SeqCst);
            })),
        )
        .expect("schedule timer");

    thread::sleep(Duration::from_millis(400));
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert!(finished.load(Ordering::SeqCst));

    server.stop();
}

#[test]
fn force_closed_connection_is_unreachable_afterward() {
    let addr: SocketAddr = "127.0.0.1:18185".parse().unwrap();
    let closed_handles: Arc<Mutex<Vec<ConnHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&closed_handles);

    struct CloseOnData {
        seen: Arc<Mutex<Vec<ConnHandle>>>,
    }
    impl Protocol for CloseOnData {
        fn on_data(&mut self, core: &Core, handle: ConnHandle) {
            self.seen.lock().unwrap().push(handle);
            core.force_close(handle);
        }
    }

    let server = start_server(addr, move |_core| {
        Box::new(CloseOnData {
            seen: Arc::clone(&seen),
        })
    });

    let mut client = connect_retrying(addr);
    client.write_all(b"bye").unwrap();

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "peer should observe EOF after force_close");

    let handle = closed_handles.lock().unwrap()[0];
    assert_eq!(server.write(handle, b"late".to_vec()).is_err(), true);

    server.stop();
}
