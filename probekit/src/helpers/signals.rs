/// # Running
///
/// Provides a simple way to notify terminations to the threads.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Clone, Default)]
pub(crate) struct Running {
    condition: Arc<AtomicBool>,
}

impl Running {
    // Create a new Running instance. Helps handling loops in various threads
    // to synchonize termination, which *must* be triggered manually.
    pub(crate) fn new() -> Running {
        Self::default()
    }

    pub(crate) fn running(&self) -> bool {
        !self.condition.load(Ordering::Relaxed)
    }

    pub(crate) fn terminate(&self) {
        self.condition.store(true, Ordering::Relaxed);
    }
}
