use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::http::HttpFetch;

pub const HOST_PLACEHOLDER: &str = "@@@DOCTORATE_HOST@@@";
pub const PORT_PLACEHOLDER: &str = "@@@DOCTORATE_PORT@@@";
pub const ACTIVITY_MIN_PLACEHOLDER: &str = "@@@DOCTORATE_ACTIVITY_MIN_START_TS@@@";
pub const ACTIVITY_MAX_PLACEHOLDER: &str = "@@@DOCTORATE_ACTIVITY_MAX_START_TS@@@";
pub const NO_PROXY_SENTINEL: &str = "NO_PROXY";

/// One script ready to be created in the session, in load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPlan {
    pub name: String,
    pub source: String,
    pub bootstrap: bool,
}

/// Makes sure the scripts directory and the bootstrap script exist, fetching
/// the bootstrap script from `bootstrap_url` when it is missing.
pub fn ensure_scripts(
    dir: &Path,
    bootstrap_name: &str,
    bootstrap_url: &str,
    fetch: &dyn HttpFetch,
    trace_id: &str,
) -> Result<PathBuf, AppError> {
    fs::create_dir_all(dir).map_err(|err| {
        AppError::system(format!("Failed to create {}: {err}", dir.display()), trace_id)
    })?;
    let bootstrap = dir.join(bootstrap_name);
    if bootstrap.is_file() {
        return Ok(bootstrap);
    }
    if bootstrap_url.trim().is_empty() {
        return Err(AppError::validation(
            format!(
                "Bootstrap script {} is missing and launcher.bootstrapScriptUrl is not set",
                bootstrap.display()
            ),
            trace_id,
        ));
    }

    info!(trace_id = %trace_id, url = %bootstrap_url, "Downloading bootstrap script");
    let body = fetch.get_bytes(bootstrap_url, trace_id)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| AppError::system(format!("Failed to stage script: {err}"), trace_id))?;
    staged
        .write_all(&body)
        .map_err(|err| AppError::system(format!("Failed to write script: {err}"), trace_id))?;
    staged
        .persist(&bootstrap)
        .map_err(|err| AppError::system(format!("Failed to save script: {}", err.error), trace_id))?;
    Ok(bootstrap)
}

/// Replaces the first occurrence of each placeholder with its configured value.
pub fn substitute_placeholders(source: &str, config: &AppConfig) -> String {
    let host = if config.server.no_proxy {
        NO_PROXY_SENTINEL.to_string()
    } else {
        config.server.host.clone()
    };
    source
        .replacen(HOST_PLACEHOLDER, &host, 1)
        .replacen(PORT_PLACEHOLDER, &config.server.port.to_string(), 1)
        .replacen(
            ACTIVITY_MIN_PLACEHOLDER,
            &config.user_config.activity_min_start_ts.to_string(),
            1,
        )
        .replacen(
            ACTIVITY_MAX_PLACEHOLDER,
            &config.user_config.activity_max_start_ts.to_string(),
            1,
        )
}

/// Builds the load list: the bootstrap script first, then every enabled
/// script in name order.
///
/// Scripts without an entry in `config.script_config` are registered as
/// disabled and skipped; the caller persists `config` afterwards.
pub fn plan_scripts(
    dir: &Path,
    bootstrap_name: &str,
    config: &mut AppConfig,
    trace_id: &str,
) -> Result<Vec<ScriptPlan>, AppError> {
    let read_err = |err: std::io::Error| {
        AppError::system(format!("Failed to read scripts in {}: {err}", dir.display()), trace_id)
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        if !entry.file_type().map_err(read_err)?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => warn!(trace_id = %trace_id, name = ?raw, "skipping script with a non UTF-8 name"),
        }
    }
    names.sort();

    let bootstrap_path = dir.join(bootstrap_name);
    let bootstrap_source = fs::read_to_string(&bootstrap_path).map_err(|err| {
        AppError::system(format!("Failed to read {}: {err}", bootstrap_path.display()), trace_id)
    })?;
    let mut plans = vec![ScriptPlan {
        name: bootstrap_name.to_string(),
        source: substitute_placeholders(&bootstrap_source, config),
        bootstrap: true,
    }];

    for name in names.into_iter().filter(|name| name != bootstrap_name) {
        let enabled = match config.script_config.get(&name) {
            Some(enabled) => *enabled,
            None => {
                info!(trace_id = %trace_id, script = %name, "New script registered as disabled");
                config.script_config.insert(name.clone(), false);
                false
            }
        };
        if !enabled {
            continue;
        }
        let path = dir.join(&name);
        let source = fs::read_to_string(&path).map_err(|err| {
            AppError::system(format!("Failed to read {}: {err}", path.display()), trace_id)
        })?;
        plans.push(ScriptPlan {
            name,
            source,
            bootstrap: false,
        });
    }
    Ok(plans)
}
