use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one recording attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Armed = 1,
    Recording = 2,
    Draining = 3,
    Stopped = 4,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Armed => "armed",
            SessionState::Recording => "recording",
            SessionState::Draining => "draining",
            SessionState::Stopped => "stopped",
        }
    }

    /// Frames are accepted only while armed or recording.
    pub fn accepts_frames(&self) -> bool {
        matches!(self, SessionState::Armed | SessionState::Recording)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Armed,
            2 => SessionState::Recording,
            3 => SessionState::Draining,
            _ => SessionState::Stopped,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Atomically observable session state, shared by the controller, the
/// frame source and the drain loop.
#[derive(Debug)]
pub struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from → to` only if the current state is `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves to `Draining` unless the session is already past it.
    pub fn begin_draining(&self) -> SessionState {
        let mut current = self.get();
        while current < SessionState::Draining {
            if self.transition(current, SessionState::Draining) {
                return SessionState::Draining;
            }
            current = self.get();
        }
        current
    }
}

impl PartialOrd for SessionState {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionState {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}
