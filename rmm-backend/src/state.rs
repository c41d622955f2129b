//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::Config;
use crate::engine::ModelRuntime;
use crate::manager::ModelManager;
use crate::prompt::{SessionStore, TemplateCatalog};

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<ModelManager>,
    pub templates: RwLock<TemplateCatalog>,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    /// Build the state from `config`, serving models through `runtime`.
    pub fn new(config: Config, runtime: Arc<dyn ModelRuntime>) -> Self {
        let manager = Arc::new(ModelManager::new(config.paths.models_dir(), runtime));
        let templates = RwLock::new(TemplateCatalog::load(config.paths.prompts_dir()));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            config.sessions.ttl_secs,
        )));

        Self {
            config,
            manager,
            templates,
            sessions,
        }
    }
}
