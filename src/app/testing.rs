//! Scripted `DeviceBridge` for flows that would otherwise need a device.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::runner::CommandOutput;
use crate::app::error::AppError;
use crate::app::models::DeviceSummary;

#[derive(Default)]
struct FakeState {
    snapshots: VecDeque<Vec<DeviceSummary>>,
    /// First matching needle wins, in registration order.
    shell: Vec<(String, VecDeque<CommandOutput>)>,
    calls: Vec<String>,
    pushed: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
pub struct FakeBridge {
    state: Mutex<FakeState>,
    root_refused: bool,
    spawn_script: Option<String>,
}

pub fn online(serial: &str) -> DeviceSummary {
    DeviceSummary {
        serial: serial.to_string(),
        state: "device".to_string(),
        model: None,
        product: None,
        device: None,
        transport_id: None,
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one `devices` result; the last queued snapshot repeats.
    pub fn with_devices(self, serials: &[&str]) -> Self {
        let snapshot = serials.iter().map(|serial| online(serial)).collect();
        self.lock().snapshots.push_back(snapshot);
        self
    }

    /// Queues a shell response for commands containing `needle`; the last one repeats.
    pub fn on_shell(self, needle: &str, stdout: &str) -> Self {
        self.on_shell_output(needle, ok(stdout))
    }

    pub fn on_shell_output(self, needle: &str, output: CommandOutput) -> Self {
        {
            let mut state = self.lock();
            match state.shell.iter_mut().find(|(known, _)| known == needle) {
                Some((_, queue)) => queue.push_back(output),
                None => state.shell.push((needle.to_string(), VecDeque::from([output]))),
            }
        }
        self
    }

    pub fn refuse_root(mut self) -> Self {
        self.root_refused = true;
        self
    }

    /// Local `sh -c` script standing in for the device-side process.
    pub fn spawn_with(mut self, script: &str) -> Self {
        self.spawn_script = Some(script.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn pushed(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().pushed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake bridge lock")
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }
}

impl DeviceBridge for FakeBridge {
    fn kill_server(&self) -> Result<(), AppError> {
        self.record("kill-server".to_string());
        Ok(())
    }

    fn start_server(&self) -> Result<(), AppError> {
        self.record("start-server".to_string());
        Ok(())
    }

    fn connect(&self, host: &str, port: u16) -> Result<bool, AppError> {
        self.record(format!("connect {host}:{port}"));
        Ok(false)
    }

    fn devices(&self) -> Result<Vec<DeviceSummary>, AppError> {
        let mut state = self.lock();
        state.calls.push("devices".to_string());
        let snapshot = if state.snapshots.len() > 1 {
            state.snapshots.pop_front().unwrap_or_default()
        } else {
            state.snapshots.front().cloned().unwrap_or_default()
        };
        Ok(snapshot)
    }

    fn shell(&self, serial: &str, command: &str) -> Result<CommandOutput, AppError> {
        let mut state = self.lock();
        state.calls.push(format!("shell {serial} {command}"));
        let Some(queue) = state
            .shell
            .iter_mut()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, queue)| queue)
        else {
            return Ok(CommandOutput {
                exit_code: Some(1),
                ..CommandOutput::default()
            });
        };
        let output = if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        };
        Ok(output)
    }

    fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), AppError> {
        let bytes = std::fs::read(local)
            .map_err(|err| AppError::system(format!("fake push: {err}"), "test"))?;
        let mut state = self.lock();
        state.calls.push(format!("push {serial} {remote}"));
        state.pushed.push((remote.to_string(), bytes));
        Ok(())
    }

    fn root(&self, serial: &str) -> Result<(), AppError> {
        self.record(format!("root {serial}"));
        if self.root_refused {
            return Err(AppError::dependency("adbd cannot run as root in production builds", "test"));
        }
        Ok(())
    }

    fn wait_for_device(&self, serial: &str) -> Result<(), AppError> {
        self.record(format!("wait-for-device {serial}"));
        Ok(())
    }

    fn reverse(&self, serial: &str, port: u16) -> Result<(), AppError> {
        self.record(format!("reverse {serial} tcp:{port}"));
        Ok(())
    }

    fn reboot(&self, serial: &str) -> Result<(), AppError> {
        self.record(format!("reboot {serial}"));
        Ok(())
    }

    fn spawn_shell(&self, serial: &str, command: &str) -> Result<Child, AppError> {
        self.record(format!("spawn {serial} {command}"));
        let script = self.spawn_script.clone().unwrap_or_else(|| "exit 0".to_string());
        Command::new("sh")
            .args(["-c", &script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AppError::system(format!("fake spawn: {err}"), "test"))
    }
}

mod tests {
    use super::*;

    #[test]
    fn first_registered_needle_wins() {
        let bridge = FakeBridge::new()
            .on_shell("dumpsys", "any dump")
            .on_shell("dumpsys connectivity", "connectivity dump");
        for _ in 0..8 {
            let output = bridge.shell("A", "dumpsys connectivity").unwrap();
            assert_eq!(output.stdout, "any dump");
        }
    }
}
