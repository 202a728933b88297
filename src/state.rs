//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It bundles the realtime services (registry, presence tracker, task
//! controller) with the store handles they sit on. Every field is a cheap
//! clone around an `Arc`, so handlers and background tasks each hold their
//! own copy.

use std::sync::Arc;

use crate::config::RealtimeConfig;
use crate::services::presence::PresenceTracker;
use crate::services::registry::Registry;
use crate::services::render::{CardRenderer, FragmentRenderer};
use crate::services::task::TaskController;
use crate::store::{AccessStore, PresenceStore, TaskStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub presence: PresenceTracker,
    pub tasks: TaskController,
    pub access: Arc<dyn AccessStore>,
    /// Present only when `htmx_update` fragments are enabled.
    pub renderer: Option<Arc<dyn FragmentRenderer>>,
    pub config: RealtimeConfig,
}

impl AppState {
    #[must_use]
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        presence_store: Arc<dyn PresenceStore>,
        access: Arc<dyn AccessStore>,
        config: RealtimeConfig,
    ) -> Self {
        let registry = Registry::new();
        let renderer: Option<Arc<dyn FragmentRenderer>> =
            config.htmx_fragments.then(|| Arc::new(CardRenderer) as Arc<dyn FragmentRenderer>);
        Self {
            presence: PresenceTracker::new(presence_store, registry.clone()),
            tasks: TaskController::new(task_store),
            registry,
            access,
            renderer,
            config,
        }
    }

    /// Swap in a different fragment renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn FragmentRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }
}


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
