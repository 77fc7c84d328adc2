use std::sync::atomic::{AtomicU8, Ordering};

/// Setup/teardown phases of an acceptor or connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum LifecycleState {
    Uninitialized = 0,
    Initialized = 1,
    Running = 2,
    Stopping = 3,
    StopComplete = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> LifecycleState {
        match value {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::StopComplete,
        }
    }
}

/// Forward-only lifecycle tracker, advanced by compare-and-swap so a state
/// is entered by exactly one caller.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Lifecycle {
        Lifecycle {
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
        }
    }

    pub(crate) fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
