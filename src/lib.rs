pub mod app;

use std::path::Path;

use uuid::Uuid;

use app::config::{config_path, load_config, AppConfig};
use app::error::AppError;
use app::logging::init_logging;

fn log_file(config: &AppConfig) -> Option<&Path> {
    let file = config.launcher.log_file.trim();
    (!file.is_empty()).then(|| Path::new(file))
}

pub fn run() -> Result<(), AppError> {
    let trace_id = Uuid::new_v4().to_string();
    let path = config_path();
    let config = match load_config(&path, &trace_id) {
        Ok(config) => config,
        Err(err) => {
            init_logging(None);
            return Err(err);
        }
    };
    init_logging(log_file(&config));
    tracing::info!(trace_id = %trace_id, config = %path.display(), "doctorate launcher starting");
    app::launcher::launch(config, &path, &trace_id)
}
