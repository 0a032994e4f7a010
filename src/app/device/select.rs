use std::io::{BufRead, Write};

use tracing::{debug, info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::models::{Device, DeviceSummary};
use crate::app::retry::RetryPolicy;

const LOOPBACK: &str = "127.0.0.1";

/// Connects the candidate emulator ports, waits for at least one online device
/// and resolves it to exactly one.
///
/// A single device, or a remembered default that is present, is returned
/// without reading `input`. Otherwise the operator picks from a 1-indexed
/// list and may store the choice in `config.user_config.default_device`.
pub fn select_device<R: BufRead, W: Write>(
    bridge: &dyn DeviceBridge,
    ports: &[u16],
    config: &mut AppConfig,
    policy: &RetryPolicy,
    input: &mut R,
    output: &mut W,
    trace_id: &str,
) -> Result<Device, AppError> {
    let devices = wait_for_devices(bridge, ports, policy, trace_id)?;

    if let [only] = devices.as_slice() {
        info!(trace_id = %trace_id, serial = %only.serial, "Using the only connected device");
        return Ok(Device::new(only.serial.clone()));
    }

    let remembered = config.user_config.default_device.trim();
    if !remembered.is_empty() {
        if let Some(found) = devices.iter().find(|device| device.serial == remembered) {
            info!(trace_id = %trace_id, serial = %found.serial, "Using remembered default device");
            return Ok(Device::new(found.serial.clone()));
        }
        debug!(trace_id = %trace_id, serial = %remembered, "remembered device is not connected");
    }

    let chosen = prompt_selection(&devices, input, output, trace_id)?;
    let serial = devices[chosen].serial.clone();
    if confirm_default(&serial, input, output, trace_id)? {
        config.user_config.default_device = serial.clone();
        info!(trace_id = %trace_id, serial = %serial, "Default device updated");
    }
    Ok(Device::new(serial))
}

fn wait_for_devices(
    bridge: &dyn DeviceBridge,
    ports: &[u16],
    policy: &RetryPolicy,
    trace_id: &str,
) -> Result<Vec<DeviceSummary>, AppError> {
    let found = policy.poll(|attempt| {
        for port in ports {
            if let Err(err) = bridge.connect(LOOPBACK, *port) {
                debug!(trace_id = %trace_id, port, error = %err, "adb connect failed");
            }
        }
        match bridge.devices() {
            Ok(devices) => {
                let online: Vec<DeviceSummary> =
                    devices.into_iter().filter(DeviceSummary::is_online).collect();
                if online.is_empty() {
                    if attempt == 1 {
                        info!(trace_id = %trace_id, "Waiting for a device to come online");
                    }
                    None
                } else {
                    Some(online)
                }
            }
            Err(err) => {
                warn!(trace_id = %trace_id, attempt, error = %err, "device enumeration failed");
                None
            }
        }
    });
    found.ok_or_else(|| AppError::dependency("No online device was found", trace_id))
}

fn prompt_selection<R: BufRead, W: Write>(
    devices: &[DeviceSummary],
    input: &mut R,
    output: &mut W,
    trace_id: &str,
) -> Result<usize, AppError> {
    let io_err = |err: std::io::Error| AppError::system(format!("Console IO failed: {err}"), trace_id);

    writeln!(output, "Multiple devices found:").map_err(io_err)?;
    for (index, device) in devices.iter().enumerate() {
        let label = match device.model.as_deref() {
            Some(model) => format!("{} ({model})", device.serial),
            None => device.serial.clone(),
        };
        writeln!(output, "  {}. {label}", index + 1).map_err(io_err)?;
    }

    loop {
        write!(output, "Select a device [1-{}]: ", devices.len()).map_err(io_err)?;
        output.flush().map_err(io_err)?;
        let mut line = String::new();
        if input.read_line(&mut line).map_err(io_err)? == 0 {
            return Err(AppError::validation(
                "Input closed before a device was selected",
                trace_id,
            ));
        }
        match line.trim().parse::<usize>() {
            Ok(choice) if (1..=devices.len()).contains(&choice) => return Ok(choice - 1),
            _ => writeln!(output, "Invalid selection: {}", line.trim()).map_err(io_err)?,
        }
    }
}

fn confirm_default<R: BufRead, W: Write>(
    serial: &str,
    input: &mut R,
    output: &mut W,
    trace_id: &str,
) -> Result<bool, AppError> {
    let io_err = |err: std::io::Error| AppError::system(format!("Console IO failed: {err}"), trace_id);
    write!(output, "Remember {serial} as the default device? [y/N]: ").map_err(io_err)?;
    output.flush().map_err(io_err)?;
    let mut line = String::new();
    input.read_line(&mut line).map_err(io_err)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::FakeBridge;
    use std::io::Cursor;
    use std::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_elapsed: None,
            max_attempts: Some(20),
        }
    }

    fn run(bridge: &FakeBridge, config: &mut AppConfig, input: &str) -> (Result<Device, AppError>, String) {
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        let mut written = Vec::new();
        let result = select_device(bridge, &[7555, 5555, 62001], config, &fast(), &mut reader, &mut written, "t");
        (result, String::from_utf8(written).unwrap())
    }

    #[test]
    fn single_device_is_returned_without_prompting() {
        let bridge = FakeBridge::new().with_devices(&["127.0.0.1:7555"]);
        let mut config = AppConfig::default();
        let (device, output) = run(&bridge, &mut config, "");
        assert_eq!(device.unwrap().serial(), "127.0.0.1:7555");
        assert!(output.is_empty());
        assert_eq!(bridge.count_calls("connect 127.0.0.1:"), 3);
    }

    #[test]
    fn remembered_default_skips_prompt() {
        let bridge = FakeBridge::new().with_devices(&["A", "B", "C"]);
        let mut config = AppConfig::default();
        config.user_config.default_device = "B".to_string();
        let (device, output) = run(&bridge, &mut config, "");
        assert_eq!(device.unwrap().serial(), "B");
        assert!(output.is_empty());
    }

    #[test]
    fn operator_picks_second_device() {
        let bridge = FakeBridge::new().with_devices(&["A", "B"]);
        let mut config = AppConfig::default();
        let (device, output) = run(&bridge, &mut config, "2\nn\n");
        assert_eq!(device.unwrap().serial(), "B");
        assert!(output.contains("  1. A"));
        assert!(output.contains("  2. B"));
        assert!(config.user_config.default_device.is_empty());
    }

    #[test]
    fn invalid_choices_reprompt() {
        let bridge = FakeBridge::new().with_devices(&["A", "B"]);
        let mut config = AppConfig::default();
        let (device, output) = run(&bridge, &mut config, "0\n99\nabc\n1\n\n");
        assert_eq!(device.unwrap().serial(), "A");
        assert_eq!(output.matches("Invalid selection").count(), 3);
        assert_eq!(output.matches("Select a device [1-2]").count(), 4);
    }

    #[test]
    fn confirmed_choice_becomes_default() {
        let bridge = FakeBridge::new().with_devices(&["A", "B"]);
        let mut config = AppConfig::default();
        config.user_config.default_device = "gone".to_string();
        let (device, _) = run(&bridge, &mut config, "2\ny\n");
        assert_eq!(device.unwrap().serial(), "B");
        assert_eq!(config.user_config.default_device, "B");
    }

    #[test]
    fn closed_input_is_an_error() {
        let bridge = FakeBridge::new().with_devices(&["A", "B"]);
        let mut config = AppConfig::default();
        let (result, _) = run(&bridge, &mut config, "abc\n");
        assert_eq!(result.unwrap_err().code, "ERR_VALIDATION");
    }

    #[test]
    fn waits_until_a_device_comes_online() {
        let bridge = FakeBridge::new()
            .with_devices(&[])
            .with_devices(&[])
            .with_devices(&["emulator-5554"]);
        let mut config = AppConfig::default();
        let (device, _) = run(&bridge, &mut config, "");
        assert_eq!(device.unwrap().serial(), "emulator-5554");
        assert_eq!(bridge.count_calls("devices"), 3);
    }

    #[test]
    fn bounded_wait_gives_up() {
        let bridge = FakeBridge::new().with_devices(&[]);
        let mut config = AppConfig::default();
        let (result, _) = run(&bridge, &mut config, "");
        assert_eq!(result.unwrap_err().code, "ERR_DEPENDENCY");
        assert_eq!(bridge.count_calls("devices"), 20);
    }
}
