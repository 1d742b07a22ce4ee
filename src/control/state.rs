//! Shared session state toggled from the control channel.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Flags shared between the control channel and whatever sits outside the
/// core (UI, launcher).
///
/// The pause flag is toggled by `pause`/`resume_all` messages; the core
/// itself only maintains it.
#[derive(Debug, Default)]
pub struct SharedState {
    paused: AtomicBool,
}

impl SharedState {
    /// Create with all flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pause flag.
    pub fn set_paused(&self, paused: bool) {
        let previous = self.paused.swap(paused, Ordering::SeqCst);
        if previous != paused {
            info!("Interception pause flag set to {}", paused);
        }
    }

    /// Current value of the pause flag.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
