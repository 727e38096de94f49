//! Process-wide Manager
//!
//! Most applications run a single manager. [`get_sse_manager`] creates it on
//! first use; later calls return the same instance and ignore their config.

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::manager::SseManager;

static GLOBAL: Mutex<Option<SseManager>> = parking_lot::const_mutex(None);

/// Get the process-wide manager, creating it with `config` if needed
///
/// `config` is ignored once the manager exists. `None` means
/// [`ManagerConfig::default`].
///
/// # Panics
///
/// Panics if the manager has to be created outside a tokio runtime.
pub fn get_sse_manager(config: Option<ManagerConfig>) -> SseManager {
    let mut global = GLOBAL.lock();
    if let Some(manager) = global.as_ref() {
        if config.is_some() {
            debug!("Global SSE manager already exists, ignoring config");
        }
        return manager.clone();
    }

    let manager = SseManager::new(config.unwrap_or_default());
    info!("Global SSE manager created");
    *global = Some(manager.clone());
    manager
}

/// Shut down and forget the process-wide manager
///
/// The next [`get_sse_manager`] call creates a fresh one.
pub async fn reset_sse_manager() {
    let previous = GLOBAL.lock().take();
    if let Some(manager) = previous {
        manager.shutdown().await;
        info!("Global SSE manager reset");
    }
}

impl SseManager {
    /// Same as [`get_sse_manager`]
    pub fn get_instance(config: Option<ManagerConfig>) -> SseManager {
        get_sse_manager(config)
    }
}
