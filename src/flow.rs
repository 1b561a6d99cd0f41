//! Component C: flow-control state for a single direction pair
//! (send, receive).
//!
//! `queen-io` has no flow-control concept of its own to generalize from;
//! this is grounded on the apply/relax semantics of a stream socket's
//! read/write flow control, where `apply` hides interest from the driver
//! to create back-pressure and `relax` restores it unless a sticky lock
//! is in effect.

/// One of the two independent directions a socket tracks flow control for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Copy, Clone, Debug, Default)]
struct DirectionState {
    want: bool,
    lock: bool,
    closed: bool,
}

impl DirectionState {
    fn new() -> DirectionState {
        DirectionState { want: true, lock: false, closed: false }
    }

    /// Returns whether the effective, driver-visible interest changed.
    fn apply(&mut self, lock: bool) -> bool {
        if self.closed {
            return false;
        }
        let before = self.effective();
        self.want = false;
        if lock {
            self.lock = true;
        }
        before != self.effective()
    }

    fn relax(&mut self, unlock: bool) -> bool {
        if self.closed {
            return false;
        }
        let before = self.effective();
        if !self.lock || unlock {
            if unlock {
                self.lock = false;
            }
            self.want = true;
        }
        before != self.effective()
    }

    fn effective(&self) -> bool {
        !self.closed && self.want
    }
}

/// Four-flag flow-control state (`wantSend`, `wantReceive`, `lockSend`,
/// `lockReceive`) per §3/§4.C.
#[derive(Copy, Clone, Debug)]
pub struct FlowControlState {
    send: DirectionState,
    receive: DirectionState,
}

impl FlowControlState {
    pub fn new() -> FlowControlState {
        FlowControlState {
            send: DirectionState::new(),
            receive: DirectionState::new(),
        }
    }

    /// Hide interest in `direction`. If `lock` is set, the restriction is
    /// sticky: a later [`relax`](Self::relax) without `unlock` will not
    /// restore interest. Returns whether the effective state changed
    /// (i.e. whether an external announcement is warranted).
    pub fn apply(&mut self, direction: Direction, lock: bool) -> bool {
        self.direction_mut(direction).apply(lock)
    }

    /// Restore interest in `direction`, unless a sticky lock is in effect
    /// and `unlock` is false.
    pub fn relax(&mut self, direction: Direction, unlock: bool) -> bool {
        self.direction_mut(direction).relax(unlock)
    }

    /// Terminal: close flow control in both directions. Idempotent.
    pub fn close(&mut self) {
        self.send.closed = true;
        self.receive.closed = true;
    }

    pub fn wants(&self, direction: Direction) -> bool {
        self.direction(direction).effective()
    }

    pub fn is_locked(&self, direction: Direction) -> bool {
        self.direction(direction).lock
    }

    pub fn is_closed(&self) -> bool {
        self.send.closed && self.receive.closed
    }

    fn direction(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Send => &mut self.send,
            Direction::Receive => &mut self.receive,
        }
    }
}

impl Default for FlowControlState {
    fn default() -> FlowControlState {
        FlowControlState::new()
    }
}
