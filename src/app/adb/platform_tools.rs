use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;
use zip::ZipArchive;

use crate::app::adb::locator::is_bare_program;
use crate::app::error::AppError;
use crate::app::http::HttpFetch;

const PLATFORM_TOOLS_DIR: &str = "platform-tools";
const ARCHIVE_NAME: &str = "adb.zip";

pub fn platform_tools_url() -> String {
    let os = if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    };
    format!("https://dl.google.com/android/repository/platform-tools-latest-{os}.zip")
}

/// Makes sure the configured adb binary exists, downloading and unpacking the
/// platform-tools bundle beside it when it does not.
pub fn ensure_adb(program: &str, fetch: &dyn HttpFetch, trace_id: &str) -> Result<String, AppError> {
    if is_bare_program(program) || Path::new(program).is_file() {
        return Ok(program.to_string());
    }

    let adb_path = PathBuf::from(program);
    let tools_dir = adb_path.parent().ok_or_else(|| {
        AppError::validation("adb path has no parent directory", trace_id)
    })?;
    if tools_dir.file_name().and_then(|name| name.to_str()) != Some(PLATFORM_TOOLS_DIR) {
        return Err(AppError::validation(
            format!("adb not found at {program} and it is not inside a {PLATFORM_TOOLS_DIR} directory"),
            trace_id,
        ));
    }
    let install_root = match tools_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let archive_path = install_root.join(ARCHIVE_NAME);
    if !archive_path.exists() {
        info!(trace_id = %trace_id, "No adb found. Downloading the latest platform-tools.");
        let body = fetch.get_bytes(&platform_tools_url(), trace_id)?;
        fs::create_dir_all(&install_root).map_err(|err| {
            AppError::system(format!("Failed to create {}: {err}", install_root.display()), trace_id)
        })?;
        fs::write(&archive_path, body).map_err(|err| {
            AppError::system(format!("Failed to save platform-tools archive: {err}"), trace_id)
        })?;
    }

    extract_archive(&archive_path, &install_root, trace_id)?;
    let _ = fs::remove_file(&archive_path);

    if !adb_path.is_file() {
        return Err(AppError::dependency(
            format!("platform-tools archive did not contain {program}"),
            trace_id,
        ));
    }
    info!(trace_id = %trace_id, adb = %program, "platform-tools installed");
    Ok(program.to_string())
}

fn extract_archive(archive_path: &Path, target: &Path, trace_id: &str) -> Result<(), AppError> {
    let file = File::open(archive_path)
        .map_err(|err| AppError::system(format!("Failed to open archive: {err}"), trace_id))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| AppError::dependency(format!("Invalid platform-tools archive: {err}"), trace_id))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| AppError::dependency(format!("Failed to read archive: {err}"), trace_id))?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = target.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|err| {
                AppError::system(format!("Failed to create {}: {err}", out_path.display()), trace_id)
            })?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::system(format!("Failed to create {}: {err}", parent.display()), trace_id)
            })?;
        }
        let mut output = File::create(&out_path).map_err(|err| {
            AppError::system(format!("Failed to extract {}: {err}", out_path.display()), trace_id)
        })?;
        io::copy(&mut entry, &mut output).map_err(|err| {
            AppError::system(format!("Failed to extract {}: {err}", out_path.display()), trace_id)
        })?;
        apply_mode(&out_path, entry.unix_mode());
    }
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) {}
