use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::app::config::{validate_config, AppConfig};
use crate::app::dispatch::{Dispatcher, Services};
use crate::app::error::AppError;
use crate::app::followup::FollowUpScheduler;
use crate::app::registry::DeviceRegistry;

/// Application root. Owns the registry and the dispatcher; the UI layer talks only to this.
pub struct AppState {
    config: AppConfig,
    registry: Arc<DeviceRegistry>,
    dispatcher: Dispatcher,
}

impl AppState {
    /// Loads the registry from disk and starts the worker pool and follow-up timer.
    pub fn new(config: AppConfig, services: Services) -> Result<Self, AppError> {
        let config = validate_config(config);
        let registry = Arc::new(DeviceRegistry::load(config.resolved_registry_path()));
        let follow_ups = FollowUpScheduler::spawn(Arc::clone(&services.clock))?;
        Self::with_parts(config, registry, services, follow_ups)
    }

    pub fn with_parts(
        config: AppConfig,
        registry: Arc<DeviceRegistry>,
        services: Services,
        follow_ups: FollowUpScheduler,
    ) -> Result<Self, AppError> {
        let config = validate_config(config);
        let dispatcher = Dispatcher::new(&config, Arc::clone(&registry), services, follow_ups)?;
        info!(
            workers = dispatcher.worker_count(),
            devices = registry.all().len(),
            "engine started"
        );
        Ok(Self {
            config,
            registry,
            dispatcher,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// `requested`, else the configured output path.
    pub(crate) fn output_dir(&self, requested: &str) -> Result<PathBuf, AppError> {
        let chosen = if requested.trim().is_empty() {
            self.config.output_path.trim()
        } else {
            requested.trim()
        };
        if chosen.is_empty() {
            return Err(AppError::validation("Output path is required", ""));
        }
        Ok(PathBuf::from(chosen))
    }
}
