use std::path::Path;
use std::process::Child;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::parse::{normalize_abi, parse_adb_devices, parse_marker_echo};
use crate::app::adb::runner::{run_command_with_timeout, spawn_logged, CommandOutput};
use crate::app::error::AppError;
use crate::app::models::{Device, DeviceSummary};

const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(180);
const WAIT_FOR_DEVICE_TIMEOUT: Duration = Duration::from_secs(120);

/// Host-side operations against the adb server and its devices.
pub trait DeviceBridge: Send + Sync {
    fn kill_server(&self) -> Result<(), AppError>;
    fn start_server(&self) -> Result<(), AppError>;
    /// Returns whether `adb connect` reported a connection; refusals are not errors.
    fn connect(&self, host: &str, port: u16) -> Result<bool, AppError>;
    fn devices(&self) -> Result<Vec<DeviceSummary>, AppError>;
    fn shell(&self, serial: &str, command: &str) -> Result<CommandOutput, AppError>;
    fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), AppError>;
    fn root(&self, serial: &str) -> Result<(), AppError>;
    fn wait_for_device(&self, serial: &str) -> Result<(), AppError>;
    fn reverse(&self, serial: &str, port: u16) -> Result<(), AppError>;
    fn reboot(&self, serial: &str) -> Result<(), AppError>;
    /// Starts a long-running device shell command and hands back the local adb child.
    fn spawn_shell(&self, serial: &str, command: &str) -> Result<Child, AppError>;
}

pub struct AdbBridge {
    program: String,
    trace_id: String,
}

impl AdbBridge {
    pub fn new(program: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            trace_id: trace_id.into(),
        }
    }

    fn run(&self, args: Vec<String>, timeout: Duration) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(&self.program, &args, timeout, &self.trace_id)
    }

    fn run_checked(&self, args: Vec<String>, timeout: Duration, what: &str) -> Result<CommandOutput, AppError> {
        let output = self.run(args, timeout)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("adb {what} failed: {}", output.detail()),
                &self.trace_id,
            ));
        }
        Ok(output)
    }

    fn device_args(serial: &str, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), serial.to_string()];
        args.extend(rest.iter().map(|value| value.to_string()));
        args
    }
}

impl DeviceBridge for AdbBridge {
    fn kill_server(&self) -> Result<(), AppError> {
        // kill-server exits non-zero when no server is running; that is fine.
        let output = self.run(vec!["kill-server".to_string()], SHORT_TIMEOUT)?;
        debug!(trace_id = %self.trace_id, exit_code = ?output.exit_code, "adb kill-server");
        Ok(())
    }

    fn start_server(&self) -> Result<(), AppError> {
        self.run_checked(vec!["start-server".to_string()], SHORT_TIMEOUT, "start-server")?;
        Ok(())
    }

    fn connect(&self, host: &str, port: u16) -> Result<bool, AppError> {
        let output = self.run(vec!["connect".to_string(), format!("{host}:{port}")], SHORT_TIMEOUT)?;
        let combined = format!("{}{}", output.stdout, output.stderr).to_lowercase();
        let connected = output.success()
            && !combined.contains("failed")
            && !combined.contains("unable")
            && !combined.contains("cannot");
        debug!(trace_id = %self.trace_id, host = %host, port, connected, "adb connect");
        Ok(connected)
    }

    fn devices(&self) -> Result<Vec<DeviceSummary>, AppError> {
        let output = self.run_checked(
            vec!["devices".to_string(), "-l".to_string()],
            SHORT_TIMEOUT,
            "devices",
        )?;
        Ok(parse_adb_devices(&output.stdout))
    }

    fn shell(&self, serial: &str, command: &str) -> Result<CommandOutput, AppError> {
        self.run(Self::device_args(serial, &["shell", command]), SHORT_TIMEOUT)
    }

    fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), AppError> {
        let local = local.to_string_lossy();
        self.run_checked(
            Self::device_args(serial, &["push", local.as_ref(), remote]),
            TRANSFER_TIMEOUT,
            "push",
        )?;
        Ok(())
    }

    fn root(&self, serial: &str) -> Result<(), AppError> {
        let output = self.run_checked(Self::device_args(serial, &["root"]), SHORT_TIMEOUT, "root")?;
        let lowered = output.stdout.to_lowercase();
        if lowered.contains("cannot run as root") || lowered.contains("not allowed") {
            return Err(AppError::dependency(
                format!("adb root refused: {}", output.detail()),
                &self.trace_id,
            ));
        }
        Ok(())
    }

    fn wait_for_device(&self, serial: &str) -> Result<(), AppError> {
        self.run_checked(
            Self::device_args(serial, &["wait-for-device"]),
            WAIT_FOR_DEVICE_TIMEOUT,
            "wait-for-device",
        )?;
        Ok(())
    }

    fn reverse(&self, serial: &str, port: u16) -> Result<(), AppError> {
        let spec = format!("tcp:{port}");
        self.run_checked(
            Self::device_args(serial, &["reverse", &spec, &spec]),
            SHORT_TIMEOUT,
            "reverse",
        )?;
        Ok(())
    }

    fn reboot(&self, serial: &str) -> Result<(), AppError> {
        self.run_checked(Self::device_args(serial, &["reboot"]), SHORT_TIMEOUT, "reboot")?;
        Ok(())
    }

    fn spawn_shell(&self, serial: &str, command: &str) -> Result<Child, AppError> {
        spawn_logged(
            &self.program,
            &Self::device_args(serial, &["shell", command]),
            "device-shell",
            &self.trace_id,
        )
    }
}

/// `test -f` through the device shell. A plain non-zero exit means absent;
/// adb reporting on stderr (offline, unauthorized) is an error.
pub fn device_file_exists(
    bridge: &dyn DeviceBridge,
    serial: &str,
    path: &str,
    trace_id: &str,
) -> Result<bool, AppError> {
    let output = bridge.shell(serial, &format!("test -f {path} && echo True"))?;
    if !output.success() && !output.stderr.trim().is_empty() {
        return Err(AppError::dependency(
            format!("Failed to check {path} on {serial}: {}", output.detail()),
            trace_id,
        ));
    }
    Ok(parse_marker_echo(&output.stdout))
}

pub fn device_abi(bridge: &dyn DeviceBridge, device: &Device, trace_id: &str) -> Result<String, AppError> {
    device.abi_or_probe(|| {
        let output = bridge.shell(device.serial(), "getprop ro.product.cpu.abi")?;
        let abi = normalize_abi(&output.stdout);
        if !output.success() || abi.is_empty() {
            return Err(AppError::dependency(
                format!("Failed to read device architecture: {}", output.detail()),
                trace_id,
            ));
        }
        Ok(abi)
    })
}
