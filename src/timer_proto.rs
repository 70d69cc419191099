//! The internal `Protocol` installed on a timer slot.
//!
//! A timer is a regular registry slot with no backing socket: its readiness
//! comes from the demultiplexer's timer source instead of a kernel fd event,
//! and `on_data` fires once per expiration.

use std::sync::Weak;

use crate::core::Core;
use crate::protocol::Protocol;
use crate::token::{ConnHandle, Token};

pub(crate) struct TimerProto {
    core: Weak<Core>,
    task: Box<dyn FnMut(&Core) + Send>,
    on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
    /// `0` means "run forever until force-closed".
    remaining_reps: u64,
}

impl TimerProto {
    pub(crate) fn new(
        core: Weak<Core>,
        task: Box<dyn FnMut(&Core) + Send>,
        on_finish: Option<Box<dyn FnOnce(&Core) + Send>>,
        remaining_reps: u64,
    ) -> TimerProto {
        TimerProto {
            core,
            task,
            on_finish,
            remaining_reps,
        }
    }
}

impl Protocol for TimerProto {
    fn service_tag(&self) -> &str {
        ""
    }

    fn on_data(&mut self, core: &Core, handle: ConnHandle) {
        let _ = core.demux().ack_timer(Token(handle.slot_index()));
        (self.task)(core);

        if self.remaining_reps > 0 {
            self.remaining_reps -= 1;
            if self.remaining_reps == 0 {
                core.force_close(handle);
            }
        }
    }

    /// Fires regardless of why the timer stopped: repeat count exhausted,
    /// or an external `force_close`/server shutdown.
    fn on_close(self: Box<Self>, _handle: ConnHandle) {
        if let (Some(core), Some(finish)) = (self.core.upgrade(), self.on_finish) {
            finish(&core);
        }
    }
}
