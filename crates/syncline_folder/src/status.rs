//! Status lamp.
//!
//! The only user-visible health indicator. Failures never surface as
//! dialogs; they move the lamp and show up in the log.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampState {
    Synced,
    Syncing,
    Error,
    Disconnected,
}

impl std::fmt::Display for LampState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LampState::Synced => "synced",
            LampState::Syncing => "syncing",
            LampState::Error => "error",
            LampState::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

#[derive(Clone)]
pub struct StatusLamp {
    tx: watch::Sender<LampState>,
}

impl StatusLamp {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LampState::Disconnected);
        Self { tx }
    }

    /// Move the lamp; transitions are logged, repeats are silent.
    pub fn set(&self, state: LampState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                log::info!("status: {state}");
                *current = state;
                true
            }
        });
    }

    pub fn get(&self) -> LampState {
        *self.tx.borrow()
    }

    /// Watch for transitions (status bar integrations subscribe here).
    pub fn subscribe(&self) -> watch::Receiver<LampState> {
        self.tx.subscribe()
    }
}

impl Default for StatusLamp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_observable() {
        let lamp = StatusLamp::new();
        let mut rx = lamp.subscribe();
        assert_eq!(lamp.get(), LampState::Disconnected);

        lamp.set(LampState::Syncing);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LampState::Syncing);

        // Setting the same state again is not a transition.
        lamp.set(LampState::Syncing);
        assert!(!rx.has_changed().unwrap());

        lamp.set(LampState::Synced);
        assert_eq!(lamp.get(), LampState::Synced);
    }
}
