use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use indexmap::IndexMap;

use crate::error::{CoreError, CoreResult};
use crate::protocol::Protocol;
use crate::rwhook::RwHook;
use crate::sys::socket::Socket;
use crate::token::ConnHandle;
use crate::writebuf::WriteBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Open,
    PendingClose,
}

struct SlotInner {
    generation: u32,
    state: SlotState,
    socket: Option<Socket>,
    protocol: Option<Box<dyn Protocol>>,
    rw_hook: Option<Box<dyn RwHook>>,
    service_tag: String,
}

/// One registry entry per possible fd value.
///
/// `generation` is duplicated on an `AtomicU32` so `set_timeout`/`touch` can
/// cheaply sanity-check a handle without taking `lock` — the spec tolerates
/// raciness here since the watchdog sweep is best-effort.
struct Slot {
    inner: Mutex<SlotInner>,
    generation_fast: AtomicU32,
    busy: AtomicBool,
    timeout_s: AtomicU64,
    last_active_s: AtomicU64,
    write_queue: Mutex<WriteBuf>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            inner: Mutex::new(SlotInner {
                generation: 0,
                state: SlotState::Free,
                socket: None,
                protocol: None,
                rw_hook: None,
                service_tag: String::new(),
            }),
            generation_fast: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            timeout_s: AtomicU64::new(0),
            last_active_s: AtomicU64::new(0),
            write_queue: Mutex::new(WriteBuf::new()),
        }
    }
}

/// Flat, fd-indexed connection table. Capacity equals `RLIMIT_NOFILE`
/// (raised to its hard limit at startup), fixed for the process lifetime, so
/// every operation below is O(1) with no resize path.
pub struct Registry {
    slots: Vec<Slot>,
    free: Mutex<Vec<u32>>,
    tag_counts: Mutex<IndexMap<String, usize>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Registry {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot::new());
        }
        // Populate back-to-front so low fd numbers (reused soonest by the
        // kernel after close) are handed out first, matching the original's
        // array-scan-from-zero allocation order.
        let free = (0..capacity as u32).rev().collect();

        Registry {
            slots,
            free: Mutex::new(free),
            tag_counts: Mutex::new(IndexMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Adopts `socket` into a free slot, installs `protocol`, and returns a
    /// fresh handle. Bumps the slot's generation so no handle from a prior
    /// occupant of this slot can ever validate again.
    pub fn open_fd(
        &self,
        socket: Socket,
        protocol: Box<dyn Protocol>,
    ) -> CoreResult<ConnHandle> {
        let slot_idx = self
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or(CoreError::ResourceExhausted("registry has no free slots"))?;

        let slot = &self.slots[slot_idx as usize];
        let mut inner = slot.inner.lock().unwrap();
        debug_assert_eq!(inner.state, SlotState::Free);

        inner.generation = inner.generation.wrapping_add(1);
        inner.state = SlotState::Open;
        inner.service_tag = protocol.service_tag().to_string();
        inner.socket = Some(socket);
        inner.protocol = Some(protocol);
        slot.generation_fast.store(inner.generation, Ordering::Release);
        slot.timeout_s.store(0, Ordering::Relaxed);
        slot.busy.store(false, Ordering::Relaxed);

        if !inner.service_tag.is_empty() {
            *self
                .tag_counts
                .lock()
                .unwrap()
                .entry(inner.service_tag.clone())
                .or_insert(0) += 1;
        }

        Ok(ConnHandle::new(slot_idx, inner.generation))
    }

    /// Opens a slot with no backing `Socket` at all — used for timer and
    /// listener slots, whose real fd (a `timerfd`, or a listening socket
    /// owned by the protocol itself) is not read or written through the
    /// registry's I/O path.
    pub fn open_virtual(&self, protocol: Box<dyn Protocol>) -> CoreResult<ConnHandle> {
        let slot_idx = self
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or(CoreError::ResourceExhausted("registry has no free slots"))?;

        let slot = &self.slots[slot_idx as usize];
        let mut inner = slot.inner.lock().unwrap();
        debug_assert_eq!(inner.state, SlotState::Free);

        inner.generation = inner.generation.wrapping_add(1);
        inner.state = SlotState::Open;
        inner.service_tag = protocol.service_tag().to_string();
        inner.socket = None;
        inner.protocol = Some(protocol);
        slot.generation_fast.store(inner.generation, Ordering::Release);
        slot.timeout_s.store(0, Ordering::Relaxed);
        slot.busy.store(false, Ordering::Relaxed);

        if !inner.service_tag.is_empty() {
            *self
                .tag_counts
                .lock()
                .unwrap()
                .entry(inner.service_tag.clone())
                .or_insert(0) += 1;
        }

        Ok(ConnHandle::new(slot_idx, inner.generation))
    }

    pub fn validate(&self, handle: ConnHandle) -> bool {
        match self.slots.get(handle.slot_index()) {
            Some(slot) => slot.generation_fast.load(Ordering::Acquire) == handle.generation,
            None => false,
        }
    }

    /// Runs `f` with mutable access to the installed protocol. The slot lock
    /// only guards taking the protocol out and putting it back; `f` itself
    /// runs with no lock held, since `f` is a user callback that is expected
    /// to call back into `Core` (`read`, `write`, `force_close`, `hijack`,
    /// ...) for this same handle. Serializing concurrent callbacks for one
    /// handle is `busy`'s job (`try_acquire_busy`/`release_busy`), not this
    /// lock's.
    ///
    /// Returns `NotConnected` if `handle` is stale or no protocol is
    /// installed. If the slot was cleared or re-`set_protocol`-ed while `f`
    /// ran, `f`'s protocol has nowhere left to go back to: nobody else holds
    /// a reference to it (`clear`/`set_protocol` only ever see `None` where
    /// this protocol used to be), so it comes back as the second element
    /// here instead of being silently dropped. The caller is responsible for
    /// its `on_close`, same as it is for the one `clear`/`set_protocol`
    /// themselves hand back.
    pub fn with_protocol<R>(
        &self,
        handle: ConnHandle,
        f: impl FnOnce(&mut dyn Protocol) -> R,
    ) -> CoreResult<(R, Option<Box<dyn Protocol>>)> {
        let slot = self.slot(handle)?;

        let mut protocol = {
            let mut inner = slot.inner.lock().unwrap();
            self.check_generation(&inner, handle)?;
            inner.protocol.take().ok_or(CoreError::NotConnected(handle))?
        };

        let result = f(protocol.as_mut());

        let mut inner = slot.inner.lock().unwrap();
        let orphaned = if inner.generation == handle.generation
            && inner.state != SlotState::Free
            && inner.protocol.is_none()
        {
            inner.protocol = Some(protocol);
            None
        } else {
            Some(protocol)
        };
        drop(inner);

        Ok((result, orphaned))
    }

    /// Swaps in `new`, returning the previous protocol (if any) so the
    /// caller can schedule its `on_close` off the slot lock. Per the
    /// decided Open Question, the swap itself is immediate; it is the
    /// caller's job to defer the old protocol's `on_close` until any
    /// in-flight callback for this handle returns.
    pub fn set_protocol(
        &self,
        handle: ConnHandle,
        new: Box<dyn Protocol>,
    ) -> CoreResult<Option<Box<dyn Protocol>>> {
        let slot = self.slot(handle)?;
        let mut inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;

        let old_tag = std::mem::replace(&mut inner.service_tag, new.service_tag().to_string());
        self.retag(&old_tag, &inner.service_tag);

        Ok(inner.protocol.replace(new))
    }

    pub fn set_rw_hook(&self, handle: ConnHandle, hook: Option<Box<dyn RwHook>>) -> CoreResult<()> {
        let slot = self.slot(handle)?;
        let mut inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;
        inner.rw_hook = hook;
        Ok(())
    }

    pub fn with_rw_hook<R>(
        &self,
        handle: ConnHandle,
        f: impl FnOnce(Option<&mut dyn RwHook>) -> R,
    ) -> CoreResult<R> {
        let slot = self.slot(handle)?;
        let mut inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;
        Ok(f(inner.rw_hook.as_deref_mut()))
    }

    pub fn with_socket<R>(&self, handle: ConnHandle, f: impl FnOnce(&Socket) -> R) -> CoreResult<R> {
        let slot = self.slot(handle)?;
        let inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;
        let socket = inner.socket.as_ref().ok_or(CoreError::NotConnected(handle))?;
        Ok(f(socket))
    }

    /// Like `with_socket` and `with_rw_hook` combined, under a single lock
    /// acquisition — `flush` needs both at once and the two can't be nested
    /// since they share the same slot mutex.
    pub fn with_socket_and_hook<R>(
        &self,
        handle: ConnHandle,
        f: impl FnOnce(&Socket, Option<&mut dyn RwHook>) -> R,
    ) -> CoreResult<R> {
        let slot = self.slot(handle)?;
        let mut inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;
        let socket = inner.socket.as_ref().ok_or(CoreError::NotConnected(handle))?;
        let hook = inner.rw_hook.as_deref_mut();
        Ok(f(socket, hook))
    }

    pub fn with_write_queue<R>(
        &self,
        handle: ConnHandle,
        f: impl FnOnce(&mut WriteBuf) -> R,
    ) -> CoreResult<R> {
        let slot = self.slot(handle)?;
        if !self.validate(handle) {
            return Err(CoreError::NotConnected(handle));
        }
        Ok(f(&mut slot.write_queue.lock().unwrap()))
    }

    /// `true` if the acquire succeeded; the caller now holds the slot's
    /// `busy_lock` and must call `release_busy` when the callback returns.
    pub fn try_acquire_busy(&self, handle: ConnHandle) -> CoreResult<bool> {
        let slot = self.slot(handle)?;
        if !self.validate(handle) {
            return Err(CoreError::NotConnected(handle));
        }
        Ok(slot
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok())
    }

    pub fn release_busy(&self, handle: ConnHandle) {
        if let Some(slot) = self.slots.get(handle.slot_index()) {
            slot.busy.store(false, Ordering::Release);
        }
    }

    /// Non-locking; races with a concurrent `clear` are tolerated since the
    /// watchdog sweep treats timeouts as best-effort.
    pub fn set_timeout(&self, handle: ConnHandle, seconds: u64) {
        if let Some(slot) = self.slots.get(handle.slot_index()) {
            if slot.generation_fast.load(Ordering::Acquire) == handle.generation {
                slot.timeout_s.store(seconds, Ordering::Relaxed);
            }
        }
    }

    pub fn timeout(&self, handle: ConnHandle) -> CoreResult<u64> {
        let slot = self.slot(handle)?;
        if !self.validate(handle) {
            return Err(CoreError::NotConnected(handle));
        }
        Ok(slot.timeout_s.load(Ordering::Relaxed))
    }

    pub fn touch(&self, handle: ConnHandle, now_s: u64) {
        if let Some(slot) = self.slots.get(handle.slot_index()) {
            slot.last_active_s.store(now_s, Ordering::Relaxed);
        }
    }

    pub fn last_active(&self, handle: ConnHandle) -> CoreResult<u64> {
        let slot = self.slot(handle)?;
        if !self.validate(handle) {
            return Err(CoreError::NotConnected(handle));
        }
        Ok(slot.last_active_s.load(Ordering::Relaxed))
    }

    /// Reconstructs the handle currently occupying `slot_index`, if any.
    /// Used by the reactor to map a bare `Token` from a readiness event back
    /// to a handle. Takes the slot lock (unlike `validate`) so it never
    /// mistakes a just-freed slot's bumped generation for a live one.
    pub fn current_handle(&self, slot_index: usize) -> Option<ConnHandle> {
        let slot = self.slots.get(slot_index)?;
        let inner = slot.inner.lock().unwrap();
        if inner.state == SlotState::Open {
            Some(ConnHandle::new(slot_index as u32, inner.generation))
        } else {
            None
        }
    }

    pub fn count(&self, service_tag: Option<&str>) -> usize {
        let counts = self.tag_counts.lock().unwrap();
        match service_tag {
            Some(tag) => counts.get(tag).copied().unwrap_or(0),
            None => counts.values().sum(),
        }
    }

    /// Iterates open slots whose tag matches (or all open slots if `tag` is
    /// `None`), calling `f(handle)` for each. Used by the idle-timeout sweep
    /// and as the scanning primitive behind broadcast tasks.
    pub fn for_each_open(&self, tag: Option<&str>, mut f: impl FnMut(ConnHandle)) {
        for (idx, slot) in self.slots.iter().enumerate() {
            let inner = slot.inner.lock().unwrap();
            if inner.state != SlotState::Open {
                continue;
            }
            if let Some(tag) = tag {
                if inner.service_tag != tag {
                    continue;
                }
            }
            f(ConnHandle::new(idx as u32, inner.generation));
        }
    }

    /// Scans forward from `cursor` (inclusive) for the next open slot
    /// matching `tag`, returning its handle and the cursor to resume from.
    /// Used by the broadcast ("each") dispatcher task so a single scan
    /// yields back to the queue between connections instead of holding the
    /// registry for the whole broadcast.
    pub fn next_in_tag(&self, tag: &str, cursor: usize) -> Option<(ConnHandle, usize)> {
        for idx in cursor..self.slots.len() {
            let inner = self.slots[idx].inner.lock().unwrap();
            if inner.state == SlotState::Open && inner.service_tag == tag {
                return Some((ConnHandle::new(idx as u32, inner.generation), idx + 1));
            }
        }
        None
    }

    pub fn mark_pending_close(&self, handle: ConnHandle) -> CoreResult<()> {
        let slot = self.slot(handle)?;
        let mut inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;
        inner.state = SlotState::PendingClose;
        Ok(())
    }

    /// Exclusively called from the close pipeline: takes the socket and
    /// protocol out of the slot, calls the hook's `on_clear` under the slot
    /// lock, bumps the generation, and frees the slot for reuse. Returns the
    /// outgoing protocol (if any) so the caller schedules `on_close` off the
    /// slot lock, and the raw fd so the caller can close it.
    pub fn clear(&self, handle: ConnHandle) -> CoreResult<(Option<Box<dyn Protocol>>, Option<Socket>)> {
        let slot = self.slot(handle)?;
        let mut inner = slot.inner.lock().unwrap();
        self.check_generation(&inner, handle)?;

        let protocol = inner.protocol.take();
        let socket = inner.socket.take();

        if let Some(hook) = inner.rw_hook.as_mut() {
            hook.on_clear(handle);
        }
        inner.rw_hook = None;

        if !inner.service_tag.is_empty() {
            self.retag(&inner.service_tag, "");
        }
        inner.service_tag.clear();

        inner.generation = inner.generation.wrapping_add(1);
        inner.state = SlotState::Free;
        slot.generation_fast.store(inner.generation, Ordering::Release);
        slot.busy.store(false, Ordering::Release);
        *slot.write_queue.lock().unwrap() = WriteBuf::new();

        drop(inner);
        self.free.lock().unwrap().push(handle.slot_index() as u32);

        Ok((protocol, socket))
    }

    fn slot(&self, handle: ConnHandle) -> CoreResult<&Slot> {
        self.slots
            .get(handle.slot_index())
            .ok_or(CoreError::NotConnected(handle))
    }

    fn check_generation(&self, inner: &SlotInner, handle: ConnHandle) -> CoreResult<()> {
        if inner.generation == handle.generation && inner.state != SlotState::Free {
            Ok(())
        } else {
            Err(CoreError::NotConnected(handle))
        }
    }

    fn retag(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut counts = self.tag_counts.lock().unwrap();
        if !old.is_empty() {
            if let Some(c) = counts.get_mut(old) {
                *c = c.saturating_sub(1);
            }
        }
        if !new.is_empty() {
            *counts.entry(new.to_string()).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::ConnHandle;

    struct Noop;
    impl Protocol for Noop {
        fn on_data(&mut self, _core: &crate::core::Core, _handle: ConnHandle) {}
    }

    fn dummy_socket() -> Socket {
        Socket::new_raw(libc::AF_INET, libc::SOCK_STREAM).unwrap()
    }

    #[test]
    fn generation_bumps_on_reopen() {
        let registry = Registry::new(4);
        let h1 = registry.open_fd(dummy_socket(), Box::new(Noop)).unwrap();
        assert!(registry.validate(h1));

        registry.clear(h1).unwrap();
        assert!(!registry.validate(h1));

        let h2 = registry.open_fd(dummy_socket(), Box::new(Noop)).unwrap();
        assert_eq!(h1.slot_index(), h2.slot_index());
        assert_ne!(h1, h2);
        assert!(registry.validate(h2));
        assert!(!registry.validate(h1));
    }

    #[test]
    fn exhausted_registry_errors() {
        let registry = Registry::new(1);
        let _h = registry.open_fd(dummy_socket(), Box::new(Noop)).unwrap();
        assert!(registry.open_fd(dummy_socket(), Box::new(Noop)).is_err());
    }

    #[test]
    fn with_protocol_reentrant_clear_does_not_deadlock() {
        let registry = Registry::new(1);
        let h = registry.open_fd(dummy_socket(), Box::new(Noop)).unwrap();

        let (ran, orphaned) = registry
            .with_protocol(h, |_p| {
                // Would deadlock here if `with_protocol` still held the
                // slot lock while running this callback.
                registry.clear(h).unwrap();
                "ran"
            })
            .unwrap();

        assert_eq!(ran, "ran");
        assert!(orphaned.is_some());
        assert!(!registry.validate(h));
    }

    #[test]
    fn with_protocol_restores_protocol_when_untouched() {
        let registry = Registry::new(1);
        let h = registry.open_fd(dummy_socket(), Box::new(Noop)).unwrap();

        let (_, orphaned) = registry.with_protocol(h, |_p| ()).unwrap();
        assert!(orphaned.is_none());
        assert!(registry.validate(h));

        let (_, orphaned) = registry.with_protocol(h, |_p| ()).unwrap();
        assert!(orphaned.is_none());
    }

    #[test]
    fn busy_lock_excludes_second_acquire() {
        let registry = Registry::new(1);
        let h = registry.open_fd(dummy_socket(), Box::new(Noop)).unwrap();
        assert!(registry.try_acquire_busy(h).unwrap());
        assert!(!registry.try_acquire_busy(h).unwrap());
        registry.release_busy(h);
        assert!(registry.try_acquire_busy(h).unwrap());
    }
}
