use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{Config, PoolOverflow};

/// Flags carried by a single queued packet.
///
/// `can_interrupt` starts `true` and flips to `false` the instant any byte
/// of the packet has gone out on the wire — once a packet is partially
/// sent, an urgent packet enqueued afterward can no longer be spliced in
/// ahead of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    pub urgent: bool,
    pub can_interrupt: bool,
    pub close_after: bool,
}

/// One element of a connection's outgoing queue.
pub enum Packet {
    Memory {
        bytes: Vec<u8>,
        offset: usize,
        flags: PacketFlags,
    },
    File {
        file: File,
        offset: u64,
        remaining: u64,
        keep_open: bool,
        flags: PacketFlags,
    },
}

impl Packet {
    pub fn memory(bytes: Vec<u8>, flags: PacketFlags) -> Packet {
        Packet::Memory {
            bytes,
            offset: 0,
            flags,
        }
    }

    pub fn file(file: File, offset: u64, len: u64, keep_open: bool, flags: PacketFlags) -> Packet {
        Packet::File {
            file,
            offset,
            remaining: len,
            keep_open,
            flags,
        }
    }

    pub fn flags(&self) -> PacketFlags {
        match self {
            Packet::Memory { flags, .. } => *flags,
            Packet::File { flags, .. } => *flags,
        }
    }

    pub fn set_can_interrupt(&mut self, value: bool) {
        match self {
            Packet::Memory { flags, .. } => flags.can_interrupt = value,
            Packet::File { flags, .. } => flags.can_interrupt = value,
        }
    }

    pub fn close_after(&self) -> bool {
        self.flags().close_after
    }

    pub fn is_drained(&self) -> bool {
        match self {
            Packet::Memory { bytes, offset, .. } => offset >= &bytes.len(),
            Packet::File { remaining, .. } => *remaining == 0,
        }
    }
}

/// Bounds the number of packets in flight across all connections so a
/// misbehaving peer can't force unbounded allocation. Scratch buffers
/// returned to the pool are reused by the next `checkout`; buffers of a
/// different capacity (e.g. from a caller-supplied large write) are simply
/// dropped instead of being kept around.
pub struct PacketPool {
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    packet_size: usize,
    capacity: usize,
    overflow: PoolOverflow,
}

impl PacketPool {
    pub fn new(cfg: &Config) -> PacketPool {
        PacketPool {
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            packet_size: cfg.packet_size,
            capacity: cfg.packet_pool_capacity,
            overflow: cfg.packet_pool_overflow,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Checks out a scratch buffer of `packet_size` capacity.
    ///
    /// Returns `None` only when the pool is at capacity and the configured
    /// overflow policy is `SpinFlush` — the caller is expected to drain
    /// other connections and retry rather than block.
    pub fn checkout(&self) -> Option<Vec<u8>> {
        if let Some(buf) = self.idle.lock().unwrap().pop() {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            return Some(buf);
        }

        if self.outstanding.load(Ordering::Relaxed) < self.capacity {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            return Some(Vec::with_capacity(self.packet_size));
        }

        match self.overflow {
            PoolOverflow::Allocate => {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                Some(Vec::with_capacity(self.packet_size))
            }
            PoolOverflow::SpinFlush => None,
        }
    }

    pub fn release(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut idle = self.idle.lock().unwrap();
        if buf.capacity() >= self.packet_size && idle.len() < self.capacity {
            buf.clear();
            idle.push(buf);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers() {
        let cfg = Config::default();
        let pool = PacketPool::new(&cfg);

        let buf = pool.checkout().unwrap();
        assert_eq!(pool.outstanding(), 1);
        pool.release(buf);
        assert_eq!(pool.outstanding(), 0);

        let buf2 = pool.checkout().unwrap();
        assert!(buf2.capacity() >= pool.packet_size());
    }

    #[test]
    fn spin_flush_reports_exhaustion() {
        let cfg = Config::builder()
            .packet_pool_capacity(1)
            .packet_pool_overflow(PoolOverflow::SpinFlush)
            .build();
        let pool = PacketPool::new(&cfg);

        let first = pool.checkout();
        assert!(first.is_some());
        assert!(pool.checkout().is_none());
    }
}
