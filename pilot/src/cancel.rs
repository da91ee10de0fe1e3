//! Cooperative cancellation shared between intake and the loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set by a producer (kill word, dashboard stop); checked at every loop boundary.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let signal = StopSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_stopped());
        signal.stop();
        assert!(observer.is_stopped());
        observer.clear();
        assert!(!signal.is_stopped());
    }
}
