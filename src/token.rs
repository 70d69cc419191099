use std::fmt;

/// The kernel-facing identifier handed to the demultiplexer on `attach`.
///
/// A `Token` is returned verbatim in every readiness event for the fd it was
/// attached with. The reactor stores a connection's slot index in the low
/// bits so an event can be mapped straight back to a `Registry` slot without
/// a second lookup table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A generational connection identifier.
///
/// This is the safe replacement for the original design's packed 64-bit
/// UUID (fd in the low bits, a per-slot counter in the high bits). Every
/// public API accepts a `ConnHandle`, never a raw fd: the `slot` field
/// indexes the registry's slot table in O(1), and `generation` must match
/// the slot's current generation or the call is rejected as stale.
///
/// A stale handle can never alias a reopened fd in the same slot because
/// `Registry::open_fd` always bumps the slot's generation counter before
/// handing out a new handle.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ConnHandle {
    pub(crate) fn new(slot: u32, generation: u32) -> ConnHandle {
        ConnHandle { slot, generation }
    }

    /// Index into the registry's slot table. Not meaningful on its own:
    /// always validate `generation` via `Registry::validate` first.
    pub fn slot_index(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnHandle({}#{})", self.slot, self.generation)
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}
