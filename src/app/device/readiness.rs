use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::parse::{classify_service_table, parse_connectivity_dump};
use crate::app::config::LauncherSettings;
use crate::app::error::AppError;
use crate::app::models::{ConnectivityStatus, Device, ServiceTable};
use crate::app::retry::RetryPolicy;
use crate::app::signal::ReadinessSignal;
use crate::app::supervisor::StageHandle;

const SERVICE_TABLE_COMMAND: &str = "netstat -tlnp";
const CONNECTIVITY_COMMAND: &str = "dumpsys connectivity";

#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    /// Pause after issuing a reboot before the first connectivity probe.
    pub settle: Duration,
    /// Soft limit for the post-reboot poll; readiness is signaled either way.
    pub timeout: Duration,
    pub backoff: RetryPolicy,
}

impl ReadinessPolicy {
    pub fn from_settings(settings: &LauncherSettings) -> Self {
        Self {
            settle: Duration::from_secs(settings.reboot_settle_secs),
            timeout: Duration::from_secs(settings.ready_timeout_secs),
            backoff: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessOutcome {
    /// No leftover state; nothing was rebooted.
    Consistent,
    /// Rebooted and the default network came back connected.
    Recovered,
    /// Rebooted but connectivity never reported ready before the soft timeout.
    TimedOut,
}

pub struct ReadinessMonitor {
    bridge: Arc<dyn DeviceBridge>,
    device: Arc<Device>,
    policy: ReadinessPolicy,
    signal: Arc<ReadinessSignal>,
    trace_id: String,
}

impl ReadinessMonitor {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        device: Arc<Device>,
        policy: ReadinessPolicy,
        signal: Arc<ReadinessSignal>,
        trace_id: &str,
    ) -> Self {
        Self {
            bridge,
            device,
            policy,
            signal,
            trace_id: trace_id.to_string(),
        }
    }

    pub fn inspect(&self) -> Result<ServiceTable, AppError> {
        let output = self.bridge.shell(self.device.serial(), SERVICE_TABLE_COMMAND)?;
        if !output.success() && output.stdout.trim().is_empty() {
            return Err(AppError::dependency(
                format!("Failed to read service table: {}", output.detail()),
                &self.trace_id,
            ));
        }
        Ok(classify_service_table(&output.stdout))
    }

    pub fn connectivity(&self) -> Result<ConnectivityStatus, AppError> {
        let output = self.bridge.shell(self.device.serial(), CONNECTIVITY_COMMAND)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("{CONNECTIVITY_COMMAND} failed: {}", output.detail()),
                &self.trace_id,
            ));
        }
        Ok(parse_connectivity_dump(&output.stdout))
    }

    /// Recovers a stale boot if needed, then signals readiness.
    ///
    /// Only a failed reboot is an error; the signal is set on every other path.
    pub fn run(&self) -> Result<ReadinessOutcome, AppError> {
        let serial = self.device.serial();
        let table = match self.inspect() {
            Ok(table) => table,
            Err(err) => {
                warn!(trace_id = %self.trace_id, serial = %serial, error = %err, "service table unavailable; assuming ready");
                self.signal.set();
                return Ok(ReadinessOutcome::Consistent);
            }
        };
        debug!(trace_id = %self.trace_id, serial = %serial, table = ?table, "service table");

        if !table.needs_reboot() {
            self.signal.set();
            return Ok(ReadinessOutcome::Consistent);
        }

        info!(trace_id = %self.trace_id, serial = %serial, "Leftover boot state detected. Rebooting device.");
        self.bridge.reboot(serial)?;
        thread::sleep(self.policy.settle);

        let started = Instant::now();
        let poll = RetryPolicy {
            max_elapsed: Some(self.policy.timeout),
            ..self.policy.backoff.clone()
        };
        let connected = poll.poll(|attempt| match self.connectivity() {
            Ok(status) if status.is_connected() => Some(()),
            Ok(status) => {
                debug!(trace_id = %self.trace_id, attempt, status = ?status, "device not ready");
                None
            }
            Err(err) => {
                warn!(trace_id = %self.trace_id, attempt, error = %err, "connectivity probe failed");
                None
            }
        });

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let outcome = if connected.is_some() {
            info!(trace_id = %self.trace_id, serial = %serial, elapsed_ms, "Device ready after reboot");
            ReadinessOutcome::Recovered
        } else {
            warn!(trace_id = %self.trace_id, serial = %serial, timeout_secs = self.policy.timeout.as_secs(), "Device not ready before timeout; continuing");
            ReadinessOutcome::TimedOut
        };
        self.signal.set();
        Ok(outcome)
    }

    pub fn spawn(self) -> Result<StageHandle<ReadinessOutcome>, AppError> {
        let trace_id = self.trace_id.clone();
        StageHandle::spawn("readiness", &trace_id, move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::runner::CommandOutput;
    use crate::app::supervisor::await_signal;
    use crate::app::testing::FakeBridge;

    const STALE: &str = "\
tcp        0      0 127.0.0.1:5037   0.0.0.0:*   LISTEN   912/adbd
tcp6       0      0 :::8080          :::*        LISTEN   567/system_server
";
    const RUNNING: &str = "\
tcp        0      0 0.0.0.0:27042    0.0.0.0:*   LISTEN   4321/frida-server
tcp6       0      0 :::8080          :::*        LISTEN   567/system_server
";
    const NOT_CONNECTED: &str = "Active default network: none\n";
    const CONNECTED: &str = "\
Active default network: 100
Current Networks:
  NetworkAgentInfo{ ni{[type: WIFI[], state: CONNECTED/CONNECTED, reason: (unspecified)]}  network{100}  nethandle{1} }
";

    fn policy(timeout: Duration) -> ReadinessPolicy {
        ReadinessPolicy {
            settle: Duration::from_millis(1),
            timeout,
            backoff: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_elapsed: None,
                max_attempts: None,
            },
        }
    }

    fn monitor(bridge: &Arc<FakeBridge>, timeout: Duration) -> (ReadinessMonitor, Arc<ReadinessSignal>) {
        let signal = Arc::new(ReadinessSignal::new());
        let monitor = ReadinessMonitor::new(
            Arc::clone(bridge) as Arc<dyn DeviceBridge>,
            Arc::new(Device::new("A")),
            policy(timeout),
            Arc::clone(&signal),
            "t",
        );
        (monitor, signal)
    }

    #[test]
    fn stale_boot_reboots_then_signals_once() {
        let bridge = Arc::new(
            FakeBridge::new()
                .on_shell("netstat", STALE)
                .on_shell("dumpsys connectivity", NOT_CONNECTED)
                .on_shell("dumpsys connectivity", CONNECTED),
        );
        let (monitor, signal) = monitor(&bridge, Duration::from_secs(5));
        let stage = monitor.spawn().unwrap();
        if let Some(stage) = await_signal(&signal, stage).unwrap() {
            assert_eq!(stage.join().unwrap(), ReadinessOutcome::Recovered);
        }
        assert_eq!(signal.set_count(), 1);
        assert_eq!(bridge.count_calls("reboot A"), 1);
        assert_eq!(bridge.count_calls("shell A dumpsys connectivity"), 2);
    }

    #[test]
    fn consistent_state_signals_without_reboot() {
        let bridge = Arc::new(FakeBridge::new().on_shell("netstat", RUNNING));
        let (monitor, signal) = monitor(&bridge, Duration::from_secs(5));
        assert_eq!(monitor.run().unwrap(), ReadinessOutcome::Consistent);
        assert!(signal.is_set());
        assert_eq!(bridge.count_calls("reboot"), 0);
    }

    #[test]
    fn soft_timeout_still_signals() {
        let bridge = Arc::new(
            FakeBridge::new()
                .on_shell("netstat", STALE)
                .on_shell("dumpsys connectivity", NOT_CONNECTED),
        );
        let (monitor, signal) = monitor(&bridge, Duration::from_millis(60));
        let stage = monitor.spawn().unwrap();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        let outcome = match await_signal(&signal, stage).unwrap() {
            Some(stage) => stage.join().unwrap(),
            None => ReadinessOutcome::TimedOut,
        };
        assert_eq!(outcome, ReadinessOutcome::TimedOut);
        assert_eq!(signal.set_count(), 1);
    }

    #[test]
    fn failed_dump_keeps_polling() {
        let failed = CommandOutput {
            stdout: String::new(),
            stderr: "Can't find service: connectivity".to_string(),
            exit_code: Some(1),
        };
        let bridge = Arc::new(
            FakeBridge::new()
                .on_shell("netstat", STALE)
                .on_shell_output("dumpsys connectivity", failed)
                .on_shell("dumpsys connectivity", CONNECTED),
        );
        let (monitor, signal) = monitor(&bridge, Duration::from_secs(5));
        assert_eq!(monitor.run().unwrap(), ReadinessOutcome::Recovered);
        assert!(signal.is_set());
    }

    #[test]
    fn missing_service_table_is_tolerated() {
        let bridge = Arc::new(FakeBridge::new());
        let (monitor, signal) = monitor(&bridge, Duration::from_secs(1));
        assert_eq!(monitor.run().unwrap(), ReadinessOutcome::Consistent);
        assert!(signal.is_set());
    }
}
