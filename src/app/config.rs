use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const DEFAULT_CANDIDATE_PORTS: [u16; 3] = [7555, 5555, 62001];
pub const DEFAULT_SERVER_DEVICE_PATH: &str = "/data/local/tmp/frida-server";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub no_proxy: bool,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_package: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            no_proxy: false,
            mode: "cn".to_string(),
            target_package: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AndroidVersion {
    pub res_version: String,
    pub client_version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VersionSettings {
    pub android: AndroidVersion,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfigContent {
    pub func_ver: String,
    pub configs: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for NetworkConfigContent {
    fn default() -> Self {
        Self {
            func_ver: String::new(),
            configs: Value::Object(Map::new()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfigRegion {
    pub content: NetworkConfigContent,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfigSettings {
    pub cn: NetworkConfigRegion,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UserSettings {
    pub default_device: String,
    pub activity_min_start_ts: i64,
    pub activity_max_start_ts: i64,
    pub activity_start_ts: i64,
    pub random_secretary: bool,
    pub random_background: bool,
    pub random_theme: bool,
    pub random_squad: bool,
    pub secretary: String,
    pub secretary_skin_id: String,
    pub background: String,
    pub theme: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            default_device: String::new(),
            activity_min_start_ts: 0,
            activity_max_start_ts: 0,
            activity_start_ts: 0,
            random_secretary: false,
            random_background: false,
            random_theme: false,
            random_squad: false,
            secretary: "char_002_amiya".to_string(),
            secretary_skin_id: "char_002_amiya#1".to_string(),
            background: "bg_rhodes_day".to_string(),
            theme: "tm_rhodes_day".to_string(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LauncherSettings {
    pub adb_path: String,
    pub candidate_ports: Vec<u16>,
    pub request_timeout_secs: u64,
    /// 0 waits for a device forever.
    pub device_wait_secs: u64,
    pub ready_timeout_secs: u64,
    pub reboot_settle_secs: u64,
    pub transport_timeout_secs: u64,
    pub scripts_dir: String,
    pub bootstrap_script: String,
    pub bootstrap_script_url: String,
    pub server_device_path: String,
    pub server_cache_dir: String,
    pub auxiliary_command: String,
    pub log_file: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path().to_string(),
            candidate_ports: DEFAULT_CANDIDATE_PORTS.to_vec(),
            request_timeout_secs: 30,
            device_wait_secs: 0,
            ready_timeout_secs: 30,
            reboot_settle_secs: 5,
            transport_timeout_secs: 10,
            scripts_dir: "scripts".to_string(),
            bootstrap_script: "_.js".to_string(),
            bootstrap_script_url: String::new(),
            server_device_path: DEFAULT_SERVER_DEVICE_PATH.to_string(),
            server_cache_dir: ".".to_string(),
            auxiliary_command: String::new(),
            log_file: "ODPy.log".to_string(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub version: VersionSettings,
    pub network_config: NetworkConfigSettings,
    pub server: ServerSettings,
    pub user_config: UserSettings,
    pub script_config: BTreeMap<String, bool>,
    pub launcher: LauncherSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_adb_path() -> &'static str {
    if cfg!(windows) {
        "platform-tools\\adb.exe"
    } else {
        "platform-tools/adb"
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DOCTORATE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("config").join("config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

/// Loads the document, applies defaults, and writes it back when defaulting
/// or validation changed anything.
pub fn load_config(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    let (config, raw) = read_config(path, trace_id)?;
    let normalized = serde_json::to_value(&config).map_err(|err| {
        AppError::system(format!("Failed to serialize config: {err}"), trace_id)
    })?;
    if raw.as_ref() != Some(&normalized) {
        tracing::info!(trace_id = %trace_id, path = %path.display(), "writing defaulted config");
        save_config(&config, path, trace_id)?;
    }
    Ok(config)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    read_config(path, trace_id).map(|(config, _)| config)
}

fn read_config(path: &Path, trace_id: &str) -> Result<(AppConfig, Option<Value>), AppError> {
    if !path.exists() {
        return Ok((validate_config(AppConfig::default()), None));
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    if !value.is_object() {
        return Err(AppError::validation(
            "Config root must be a JSON object",
            trace_id,
        ));
    }
    let config: AppConfig = serde_json::from_value(value.clone()).map_err(|err| {
        AppError::validation(format!("Config has an invalid value: {err}"), trace_id)
    })?;
    Ok((validate_config(config), Some(value)))
}

pub fn save_config(config: &AppConfig, path: &Path, trace_id: &str) -> Result<(), AppError> {
    save_config_to_path(config, path, &backup_config_path(path), trace_id)
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|err| {
        AppError::system(format!("Failed to create config directory: {err}"), trace_id)
    })?;
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;

    // Write beside the target and rename so readers never observe a partial document.
    let mut staged = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|err| AppError::system(format!("Failed to stage config: {err}"), trace_id))?;
    staged
        .write_all(payload.as_bytes())
        .and_then(|_| staged.flush())
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    staged
        .persist(path)
        .map_err(|err| AppError::system(format!("Failed to replace config: {}", err.error), trace_id))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = LauncherSettings::default();
    if config.server.port == 0 {
        config.server.port = ServerSettings::default().port;
    }
    config.server.mode = config.server.mode.trim().to_lowercase();
    if config.server.mode.is_empty() {
        config.server.mode = ServerSettings::default().mode;
    }
    if config
        .server
        .target_package
        .as_deref()
        .is_some_and(|value| value.trim().is_empty())
    {
        config.server.target_package = None;
    }
    if config.launcher.adb_path.trim().is_empty() {
        config.launcher.adb_path = defaults.adb_path.clone();
    }
    config.launcher.candidate_ports.retain(|port| *port != 0);
    if config.launcher.candidate_ports.is_empty() {
        config.launcher.candidate_ports = defaults.candidate_ports.clone();
    }
    if config.launcher.request_timeout_secs == 0 {
        config.launcher.request_timeout_secs = defaults.request_timeout_secs;
    }
    if config.launcher.ready_timeout_secs == 0 {
        config.launcher.ready_timeout_secs = defaults.ready_timeout_secs;
    }
    if config.launcher.transport_timeout_secs == 0 {
        config.launcher.transport_timeout_secs = defaults.transport_timeout_secs;
    }
    if config.launcher.scripts_dir.trim().is_empty() {
        config.launcher.scripts_dir = defaults.scripts_dir.clone();
    }
    if config.launcher.bootstrap_script.trim().is_empty() {
        config.launcher.bootstrap_script = defaults.bootstrap_script.clone();
    }
    if !config.launcher.server_device_path.starts_with('/') {
        config.launcher.server_device_path = defaults.server_device_path.clone();
    }
    if config.launcher.server_cache_dir.trim().is_empty() {
        config.launcher.server_cache_dir = defaults.server_cache_dir;
    }
    config
}
