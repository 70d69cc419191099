use std::io;

use crate::token::ConnHandle;

/// Crate-wide error type, covering the failure categories the original
/// design distinguished informally in its error table: a stale handle, a
/// transport failure that already triggered the close pipeline, resource
/// exhaustion, a fatal demultiplexer failure, and a failed `listen`.
///
/// `WouldBlock` and `Interrupted` are deliberately absent: they are
/// control-flow, not errors, and never escape the I/O loops that handle
/// them (see `writebuf::flush` and `reactor`).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The handle's generation no longer matches its slot; the connection
    /// this handle once named has since closed (and possibly reopened as a
    /// different connection in the same slot).
    #[error("connection {0:?} is no longer connected")]
    NotConnected(ConnHandle),

    /// A read/write/sendfile call hit a non-recoverable transport error.
    /// By the time this is observed the slot has already been marked
    /// `pending_close`.
    #[error("transport error on {handle:?}: {source}")]
    Transport {
        handle: ConnHandle,
        #[source]
        source: io::Error,
    },

    /// The packet pool was exhausted and the configured overflow policy
    /// forbids allocating past it, or the registry has no free slots.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// `Demux::wait` failed for a reason other than `EINTR`; the reactor
    /// that owns it is shutting down.
    #[error("demultiplexer failed fatally: {0}")]
    DemuxFatal(#[source] io::Error),

    /// `bind`/`listen` failed; no server was started for that address.
    #[error("failed to listen: {0}")]
    ListenFailed(#[source] io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Outcome of a non-blocking read/write/sendfile attempt, distinguishing
/// "no bytes moved, try again later" from both success and hard failure so
/// callers never have to pattern-match on `io::ErrorKind` themselves.
///
/// `Interrupted` is kept distinct from `WouldBlock`: the former means the
/// syscall never actually ran (EINTR), so the right response is to retry it
/// immediately; the latter means the socket buffer is genuinely full, so the
/// right response is to stop and wait for the next readiness event. Folding
/// the two together makes a flush loop defer bytes that were always ready to
/// go out, for as long as it takes the next epoll/kqueue wakeup to arrive.
#[derive(Debug)]
pub enum IoOutcome {
    Done(usize),
    WouldBlock,
    Interrupted,
}

pub(crate) fn classify_io(res: io::Result<usize>) -> io::Result<IoOutcome> {
    match res {
        Ok(n) => Ok(IoOutcome::Done(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(IoOutcome::Interrupted),
        Err(e) => Err(e),
    }
}
