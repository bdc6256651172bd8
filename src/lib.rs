pub mod app;

use app::config::AppConfig;
use app::dispatch::Services;
use app::error::AppError;
use app::logging::init_logging;
use app::state::AppState;

/// Installs the tracing subscriber and brings the engine up.
pub fn start(config: AppConfig, services: Services) -> Result<AppState, AppError> {
    init_logging();
    AppState::new(config, services)
}
