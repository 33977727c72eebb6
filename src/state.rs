//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It owns every in-memory table the relay needs: the connection registry,
//! the board session table, voice presence, and the persistence adapter.
//! Nothing lives in process globals, so tests build as many independent
//! relays as they like.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::services::registry::ConnectionRegistry;
use crate::services::session::SessionTable;
use crate::services::voice::VoicePresence;
use crate::store::SnapshotStore;

/// Shared application state. Clone is required by Axum; all fields are Arc-backed.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub sessions: SessionTable,
    pub voice: VoicePresence,
    pub store: Arc<dyn SnapshotStore>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(config: RelayConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            sessions: SessionTable::new(config.grace_period),
            voice: VoicePresence::new(),
            store,
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::time::Duration;

    use super::*;
    use crate::store::memory::MemoryStore;

    /// Config with short timers so lifecycle tests finish quickly.
    #[must_use]
    pub fn test_config() -> RelayConfig {
        RelayConfig {
            grace_period: Duration::from_millis(150),
            autosave_debounce: Duration::from_millis(60),
            ..RelayConfig::default()
        }
    }

    /// Test `AppState` over a fresh `MemoryStore`. The store handle is returned for assertions.
    #[must_use]
    pub fn test_app_state_with(config: RelayConfig) -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(config, Arc::clone(&store) as Arc<dyn SnapshotStore>);
        (state, store)
    }

    #[must_use]
    pub fn test_app_state() -> AppState {
        test_app_state_with(test_config()).0
    }
}
