use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use xz2::read::XzDecoder;

use crate::app::adb::bridge::{device_abi, device_file_exists, DeviceBridge};
use crate::app::config::LauncherSettings;
use crate::app::error::AppError;
use crate::app::http::HttpFetch;
use crate::app::models::Device;

pub const LATEST_RELEASE_URL: &str = "https://api.github.com/repos/frida/frida/releases/latest";
const PLAIN_BINARY_NAME: &str = "frida-server";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum InstallOutcome {
    AlreadyInstalled,
    Installed {
        abi: String,
        tag: Option<String>,
        from_cache: bool,
    },
}

pub fn release_asset_url(tag: &str, abi: &str) -> String {
    format!("https://github.com/frida/frida/releases/download/{tag}/frida-server-{tag}-android-{abi}.xz")
}

pub fn cache_file_name(abi: &str) -> String {
    format!("frida-server-{abi}.xz")
}

pub fn latest_release_tag(fetch: &dyn HttpFetch, trace_id: &str) -> Result<String, AppError> {
    let release = fetch.get_json(LATEST_RELEASE_URL, trace_id)?;
    release
        .get("tag_name")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::network("Release metadata has no tag_name", trace_id))
}

/// Installs the instrumentation server on `device` unless the binary is
/// already at `settings.server_device_path`.
///
/// The compressed download stays in `settings.server_cache_dir` for reuse;
/// the decompressed copy is removed once pushed.
pub fn ensure_installed(
    bridge: &dyn DeviceBridge,
    device: &Device,
    settings: &LauncherSettings,
    fetch: &dyn HttpFetch,
    trace_id: &str,
) -> Result<InstallOutcome, AppError> {
    let serial = device.serial();
    let remote = settings.server_device_path.as_str();
    if device_file_exists(bridge, serial, remote, trace_id)? {
        info!(trace_id = %trace_id, serial = %serial, path = %remote, "frida-server already installed");
        return Ok(InstallOutcome::AlreadyInstalled);
    }

    let abi = device_abi(bridge, device, trace_id)?;
    let cache_dir = PathBuf::from(&settings.server_cache_dir);
    fs::create_dir_all(&cache_dir).map_err(|err| {
        AppError::system(format!("Failed to create {}: {err}", cache_dir.display()), trace_id)
    })?;

    let cached = cache_dir.join(cache_file_name(&abi));
    let mut tag = None;
    let from_cache = cached.is_file();
    if !from_cache {
        let latest = latest_release_tag(fetch, trace_id)?;
        info!(trace_id = %trace_id, tag = %latest, abi = %abi, "Downloading frida-server");
        let body = fetch.get_bytes(&release_asset_url(&latest, &abi), trace_id)?;
        write_atomically(&cache_dir, &cached, &body, trace_id)?;
        tag = Some(latest);
    }

    let plain = cache_dir.join(PLAIN_BINARY_NAME);
    if let Err(err) = decompress(&cached, &plain, trace_id) {
        let _ = fs::remove_file(&plain);
        // A truncated cache would fail the same way forever.
        let _ = fs::remove_file(&cached);
        return Err(err);
    }

    let pushed = push_executable(bridge, serial, &plain, remote, trace_id);
    if let Err(err) = fs::remove_file(&plain) {
        warn!(trace_id = %trace_id, path = %plain.display(), error = %err, "failed to remove decompressed frida-server");
    }
    pushed?;

    info!(trace_id = %trace_id, serial = %serial, abi = %abi, "frida-server installed");
    Ok(InstallOutcome::Installed { abi, tag, from_cache })
}

fn write_atomically(dir: &Path, target: &Path, body: &[u8], trace_id: &str) -> Result<(), AppError> {
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| AppError::system(format!("Failed to stage download: {err}"), trace_id))?;
    staged
        .write_all(body)
        .map_err(|err| AppError::system(format!("Failed to write download: {err}"), trace_id))?;
    staged
        .persist(target)
        .map_err(|err| AppError::system(format!("Failed to save download: {}", err.error), trace_id))?;
    Ok(())
}

fn decompress(archive: &Path, target: &Path, trace_id: &str) -> Result<(), AppError> {
    let input = File::open(archive)
        .map_err(|err| AppError::system(format!("Failed to open {}: {err}", archive.display()), trace_id))?;
    let mut decoder = XzDecoder::new(input);
    let mut output = File::create(target)
        .map_err(|err| AppError::system(format!("Failed to create {}: {err}", target.display()), trace_id))?;
    io::copy(&mut decoder, &mut output).map_err(|err| {
        AppError::dependency(format!("Failed to decompress {}: {err}", archive.display()), trace_id)
    })?;
    Ok(())
}

fn push_executable(
    bridge: &dyn DeviceBridge,
    serial: &str,
    local: &Path,
    remote: &str,
    trace_id: &str,
) -> Result<(), AppError> {
    bridge.push(serial, local, remote)?;
    let output = bridge.shell(serial, &format!("chmod 755 {remote}"))?;
    if !output.success() {
        return Err(AppError::dependency(
            format!("chmod {remote} failed: {}", output.detail()),
            trace_id,
        ));
    }
    Ok(())
}
