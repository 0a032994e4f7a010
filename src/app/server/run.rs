use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::bridge::DeviceBridge;
use crate::app::error::AppError;
use crate::app::models::Device;
use crate::app::signal::ReadinessSignal;
use crate::app::supervisor::{ChildControl, ChildExit, StageHandle};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Restarts the adb host, opens the reverse tunnel, signals, then keeps the
/// device-side server running under supervision until stopped.
pub struct ServerStage {
    bridge: Arc<dyn DeviceBridge>,
    device: Arc<Device>,
    port: u16,
    device_path: String,
    signal: Arc<ReadinessSignal>,
    control: ChildControl,
    trace_id: String,
}

impl ServerStage {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        device: Arc<Device>,
        port: u16,
        device_path: &str,
        signal: Arc<ReadinessSignal>,
        trace_id: &str,
    ) -> Self {
        Self {
            bridge,
            device,
            port,
            device_path: device_path.to_string(),
            signal,
            control: ChildControl::new(),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn control(&self) -> ChildControl {
        self.control.clone()
    }

    fn prepare(&self) -> Result<(), AppError> {
        let serial = self.device.serial();
        self.bridge.kill_server()?;
        self.bridge.start_server()?;
        // A fresh adb host forgets network transports.
        if let Some((host, port)) = network_endpoint(serial) {
            if !self.bridge.connect(host, port)? {
                warn!(trace_id = %self.trace_id, serial = %serial, "adb reconnect was refused");
            }
        }
        if let Err(err) = self.bridge.root(serial) {
            warn!(trace_id = %self.trace_id, serial = %serial, error = %err, "adb root unavailable; continuing without it");
        }
        self.bridge.wait_for_device(serial)?;
        self.bridge.reverse(serial, self.port)?;
        info!(trace_id = %self.trace_id, serial = %serial, port = self.port, "Reverse tunnel established");
        Ok(())
    }

    pub fn run(&self) -> Result<ChildExit, AppError> {
        self.prepare()?;
        self.signal.set();

        let serial = self.device.serial();
        let child = self.bridge.spawn_shell(serial, &self.device_path)?;
        info!(trace_id = %self.trace_id, serial = %serial, path = %self.device_path, "frida-server started");
        self.control.install(child);

        let exit = self.control.supervise(EXIT_POLL_INTERVAL);
        if exit.stopped {
            info!(trace_id = %self.trace_id, serial = %serial, "frida-server stopped");
        } else {
            warn!(trace_id = %self.trace_id, serial = %serial, exit_code = ?exit.code, "frida-server exited unexpectedly");
        }
        Ok(exit)
    }

    /// Runs the stage on its own thread; the returned control stops the server.
    pub fn spawn(self) -> Result<(ChildControl, StageHandle<ChildExit>), AppError> {
        let control = self.control();
        let trace_id = self.trace_id.clone();
        let stage = StageHandle::spawn("frida-server", &trace_id, move || self.run())?;
        Ok((control, stage))
    }
}

fn network_endpoint(serial: &str) -> Option<(&str, u16)> {
    let (host, port) = serial.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}
