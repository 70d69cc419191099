//! A single-host, edge-triggered, multi-reactor TCP server engine.
//!
//! One process runs one [`Server`], backed by one [`Core`]: a single
//! `epoll`/`kqueue` reactor thread dispatching readiness events onto a fixed
//! thread pool, a flat generation-checked connection registry, and a
//! per-connection ordered write queue with urgent-insertion and `sendfile`
//! support. Application code implements [`Protocol`] and optionally
//! [`RwHook`] (for a TLS or instrumentation layer) and drives everything
//! else through [`Server`].
//!
//! ```no_run
//! use edge_core::{Config, Protocol, Server};
//! use edge_core::core::Core;
//! use edge_core::token::ConnHandle;
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn on_data(&mut self, core: &Core, handle: ConnHandle) {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(edge_core::error::IoOutcome::Done(n)) = core.read(handle, &mut buf) {
//!             if n == 0 {
//!                 core.force_close(handle);
//!                 return;
//!             }
//!             let _ = core.write(handle, buf[..n].to_vec());
//!         }
//!     }
//! }
//!
//! let server = Server::new(Config::default()).unwrap();
//! server.listen("0.0.0.0:3000".parse().unwrap(), |_core| Box::new(Echo)).unwrap();
//! server.run();
//! ```

pub mod config;
pub mod core;
pub mod demux;
pub(crate) mod dispatcher;
pub mod error;
mod lifecycle;
mod listener_proto;
pub mod packet;
pub mod protocol;
mod reactor;
pub mod ready;
pub mod registry;
pub mod rwhook;
mod server;
pub mod sys;
mod timer_proto;
pub mod token;
pub mod writebuf;

pub use config::Config;
pub use core::Core;
pub use error::{CoreError, CoreResult};
pub use protocol::Protocol;
pub use rwhook::RwHook;
pub use server::Server;
pub use token::{ConnHandle, Token};
