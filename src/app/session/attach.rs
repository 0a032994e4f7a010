use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use frida::{DeviceManager, Frida, ScriptOption, SpawnOptions};
use serde::Serialize;
use tracing::{info, warn};

use crate::app::config::{save_config, AppConfig, ServerSettings};
use crate::app::error::AppError;
use crate::app::http::HttpFetch;
use crate::app::models::Device;
use crate::app::retry::RetryPolicy;
use crate::app::session::messages::{MessageSink, ScriptMessages};
use crate::app::session::scripts::{ensure_scripts, plan_scripts, ScriptPlan};

pub const CN_PACKAGE: &str = "com.hypergryph.arknights";
pub const GLOBAL_PACKAGE: &str = "com.YoStarEN.Arknights";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Realm {
    Native,
    Emulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetProfile {
    pub package: String,
    pub realm: Realm,
}

/// Maps `server.mode` to the target, letting `server.targetPackage` override
/// the package while the mode still decides the realm.
pub fn resolve_target(server: &ServerSettings, trace_id: &str) -> Result<TargetProfile, AppError> {
    let (package, realm) = match server.mode.as_str() {
        "cn" => (CN_PACKAGE, Realm::Native),
        "global" => (GLOBAL_PACKAGE, Realm::Emulated),
        other => {
            return Err(AppError::validation(
                format!("Unknown server.mode {other:?}; expected \"cn\" or \"global\""),
                trace_id,
            ))
        }
    };
    let package = server
        .target_package
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(package);
    Ok(TargetProfile {
        package: package.to_string(),
        realm,
    })
}

/// Everything `run_session` needs besides the frida runtime itself.
pub struct SessionRequest<'a> {
    pub device: &'a Device,
    pub config: &'a mut AppConfig,
    pub config_path: &'a Path,
    pub fetch: &'a dyn HttpFetch,
    pub sink: Arc<dyn MessageSink>,
    pub trace_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub pid: u32,
    pub target: TargetProfile,
    pub scripts: Vec<String>,
}

/// Prepares the script plan and persists any newly registered scripts.
pub fn prepare_scripts(
    config: &mut AppConfig,
    config_path: &Path,
    fetch: &dyn HttpFetch,
    trace_id: &str,
) -> Result<Vec<ScriptPlan>, AppError> {
    let dir = Path::new(&config.launcher.scripts_dir).to_path_buf();
    let bootstrap = config.launcher.bootstrap_script.clone();
    ensure_scripts(&dir, &bootstrap, &config.launcher.bootstrap_script_url, fetch, trace_id)?;
    let plans = plan_scripts(&dir, &bootstrap, config, trace_id)?;
    save_config(config, config_path, trace_id)?;
    Ok(plans)
}

/// Spawns the target, attaches, loads the planned scripts and keeps the
/// session alive until `control` reaches end of input.
pub fn run_session<R: Read>(request: SessionRequest<'_>, control: &mut R) -> Result<SessionSummary, AppError> {
    let SessionRequest {
        device,
        config,
        config_path,
        fetch,
        sink,
        trace_id,
    } = request;
    let instrumentation = |stage: &str, err: frida::Error| {
        AppError::instrumentation(format!("{stage} failed: {err}"), trace_id)
    };

    let target = resolve_target(&config.server, trace_id)?;
    let plans = prepare_scripts(config, config_path, fetch, trace_id)?;

    let frida = unsafe { Frida::obtain() };
    let manager = DeviceManager::obtain(&frida);
    let transport = RetryPolicy::with_deadline(Duration::from_secs(config.launcher.transport_timeout_secs));
    let mut frida_device = transport
        .poll(|_| {
            manager
                .enumerate_all_devices()
                .into_iter()
                .find(|candidate| candidate.get_id() == device.serial())
        })
        .ok_or_else(|| {
            AppError::instrumentation(
                format!("frida transport for {} did not appear", device.serial()),
                trace_id,
            )
        })?;

    let pid = frida_device
        .spawn(&target.package, &SpawnOptions::new())
        .map_err(|err| instrumentation("spawn", err))?;
    frida_device
        .resume(pid)
        .map_err(|err| instrumentation("resume", err))?;
    info!(trace_id = %trace_id, package = %target.package, pid, "Target spawned");

    if target.realm == Realm::Emulated {
        // TODO: pass the realm once the frida bindings expose attach options.
        warn!(trace_id = %trace_id, package = %target.package, "emulated realm requested; attaching in the native realm");
    }
    let session = frida_device
        .attach(pid)
        .map_err(|err| instrumentation("attach", err))?;

    let mut loaded = Vec::with_capacity(plans.len());
    for plan in &plans {
        let mut script = session
            .create_script(&plan.source, &mut ScriptOption::new())
            .map_err(|err| instrumentation(&format!("create script {}", plan.name), err))?;
        script
            .handle_message(ScriptMessages::new(&plan.name, Arc::clone(&sink)))
            .map_err(|err| instrumentation(&format!("message handler for {}", plan.name), err))?;
        script
            .load()
            .map_err(|err| instrumentation(&format!("load {}", plan.name), err))?;
        info!(trace_id = %trace_id, script = %plan.name, bootstrap = plan.bootstrap, "Script loaded");
        loaded.push(script);
    }

    info!(trace_id = %trace_id, "Launching game... close the input (Ctrl-D / Ctrl-Z) to end the session");
    if let Err(err) = io::copy(control, &mut io::sink()) {
        warn!(trace_id = %trace_id, error = %err, "control channel read failed; ending session");
    }

    drop(loaded);
    session
        .detach()
        .map_err(|err| instrumentation("detach", err))?;
    info!(trace_id = %trace_id, pid, "Session detached");

    Ok(SessionSummary {
        pid,
        target,
        scripts: plans.into_iter().map(|plan| plan.name).collect(),
    })
}
