//! Component D: per-direction shutdown progress tracking.
//!
//! No direct counterpart in `queen-io`; grounded on the shutdown-sequence
//! semantics of a stream socket's shutdown state machine: progression
//! `open -> sendShut | recvShut -> bothShut -> completed`, monotone (no
//! state is ever revisited), with the origin (local call vs. peer EOF)
//! recorded per side.

/// Who drove a particular shutdown transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// The local socket called `shutdown`.
    Source,
    /// The peer closed its side (EOF observed, or a half-close signal).
    Destination,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Progress {
    Open,
    SendShut,
    RecvShut,
    BothShut,
    Completed,
}

/// The outcome of a [`ShutdownState`] call that drove a transition.
/// Only returned when the call actually changed the state (idempotent,
/// race-safe repeats return `None`).
#[derive(Copy, Clone, Debug)]
pub struct TransitionContext {
    /// True if this call initiated the shutdown sequence (i.e. the state
    /// was `Open` before this call).
    pub initiated: bool,
    /// True if send has just transitioned to shut by this call.
    pub send_just_shut: bool,
    /// True if receive has just transitioned to shut by this call.
    pub receive_just_shut: bool,
    /// True if the overall sequence is now completed.
    pub completed: bool,
}

/// Tracks shutdown progress for both directions of a connection.
#[derive(Debug)]
pub struct ShutdownState {
    progress: Progress,
    send_shut: bool,
    receive_shut: bool,
    send_origin: Option<Origin>,
    receive_origin: Option<Origin>,
}

impl ShutdownState {
    pub fn new() -> ShutdownState {
        ShutdownState {
            progress: Progress::Open,
            send_shut: false,
            receive_shut: false,
            send_origin: None,
            receive_origin: None,
        }
    }

    /// Attempt to shut the send side. Returns `None` if send was already
    /// shut (idempotent no-op).
    pub fn try_shutdown_send(&mut self, origin: Origin) -> Option<TransitionContext> {
        if self.send_shut {
            return None;
        }
        let initiated = self.progress == Progress::Open;
        self.send_shut = true;
        self.send_origin = Some(origin);
        Some(self.advance(initiated, true, false))
    }

    /// Attempt to shut the receive side. Returns `None` if receive was
    /// already shut.
    pub fn try_shutdown_receive(&mut self, origin: Origin) -> Option<TransitionContext> {
        if self.receive_shut {
            return None;
        }
        let initiated = self.progress == Progress::Open;
        self.receive_shut = true;
        self.receive_origin = Some(origin);
        Some(self.advance(initiated, false, true))
    }

    fn advance(&mut self, initiated: bool, send_just: bool, recv_just: bool) -> TransitionContext {
        self.progress = match (self.send_shut, self.receive_shut) {
            (false, false) => Progress::Open,
            (true, false) => Progress::SendShut,
            (false, true) => Progress::RecvShut,
            (true, true) => Progress::BothShut,
        };
        let completed = self.progress == Progress::BothShut;
        if completed {
            self.progress = Progress::Completed;
        }
        TransitionContext {
            initiated,
            send_just_shut: send_just,
            receive_just_shut: recv_just,
            completed,
        }
    }

    pub fn completed(&self) -> bool {
        self.progress == Progress::Completed
    }

    pub fn is_send_shut(&self) -> bool {
        self.send_shut
    }

    pub fn is_receive_shut(&self) -> bool {
        self.receive_shut
    }

    pub fn send_origin(&self) -> Option<Origin> {
        self.send_origin
    }

    pub fn receive_origin(&self) -> Option<Origin> {
        self.receive_origin
    }
}

impl Default for ShutdownState {
    fn default() -> ShutdownState {
        ShutdownState::new()
    }
}
