use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::bridge::{AdbBridge, DeviceBridge};
use crate::app::adb::locator::{resolve_adb_program, validate_adb_program};
use crate::app::adb::platform_tools::ensure_adb;
use crate::app::auxiliary::start_auxiliary;
use crate::app::config::{save_config, AppConfig};
use crate::app::device::readiness::{ReadinessMonitor, ReadinessPolicy};
use crate::app::device::select::select_device;
use crate::app::error::AppError;
use crate::app::http::{HttpFetch, UreqFetch};
use crate::app::models::Device;
use crate::app::retry::RetryPolicy;
use crate::app::server::install::ensure_installed;
use crate::app::server::run::ServerStage;
use crate::app::session::attach::{run_session, SessionRequest};
use crate::app::session::messages::LogSink;
use crate::app::signal::ReadinessSignal;
use crate::app::supervisor::{await_signal, ChildControl, ChildExit, StageHandle};

/// Pause between the server signaling and the first attach attempt.
const SERVER_WARMUP: Duration = Duration::from_millis(250);

pub fn device_wait_policy(wait_secs: u64) -> RetryPolicy {
    if wait_secs == 0 {
        RetryPolicy::default()
    } else {
        RetryPolicy::with_deadline(Duration::from_secs(wait_secs))
    }
}

/// Resolves the adb binary, downloading platform-tools when the configured
/// path is missing.
pub fn prepare_adb(config: &AppConfig, fetch: &dyn HttpFetch, trace_id: &str) -> Result<String, AppError> {
    let program = resolve_adb_program(&config.launcher.adb_path);
    let program = ensure_adb(&program, fetch, trace_id)?;
    validate_adb_program(&program).map_err(|message| AppError::dependency(message, trace_id))?;
    Ok(program)
}

/// Everything started before the session: the selected device and the
/// supervised frida-server stage.
pub struct BringUp {
    pub device: Arc<Device>,
    pub server_control: ChildControl,
    pub server_stage: Option<StageHandle<ChildExit>>,
}

impl BringUp {
    /// Stops frida-server and reaps its stage.
    pub fn shutdown(self, trace_id: &str) {
        self.server_control.stop();
        if let Some(stage) = self.server_stage {
            match stage.join() {
                Ok(exit) => debug!(trace_id = %trace_id, exit = ?exit, "frida-server stage finished"),
                Err(err) => warn!(trace_id = %trace_id, error = %err, "frida-server stage failed"),
            }
        }
    }
}

/// Device selection, readiness, install and server start, in that order.
/// Returns once the reverse tunnel is up and frida-server has been launched.
pub fn bring_up<R: BufRead, W: Write>(
    bridge: Arc<dyn DeviceBridge>,
    fetch: &dyn HttpFetch,
    config: &mut AppConfig,
    config_path: &Path,
    input: &mut R,
    output: &mut W,
    trace_id: &str,
) -> Result<BringUp, AppError> {
    bridge.kill_server()?;
    bridge.start_server()?;

    info!(trace_id = %trace_id, "Attempting connection to emulator...");
    let remembered = config.user_config.default_device.clone();
    let ports = config.launcher.candidate_ports.clone();
    let wait = device_wait_policy(config.launcher.device_wait_secs);
    let device = select_device(bridge.as_ref(), &ports, config, &wait, input, output, trace_id)?;
    if config.user_config.default_device != remembered {
        save_config(config, config_path, trace_id)?;
    }
    let device = Arc::new(device);
    info!(trace_id = %trace_id, serial = %device.serial(), "Device selected");

    let device_ready = Arc::new(ReadinessSignal::new());
    let monitor = ReadinessMonitor::new(
        Arc::clone(&bridge),
        Arc::clone(&device),
        ReadinessPolicy::from_settings(&config.launcher),
        Arc::clone(&device_ready),
        trace_id,
    );
    if let Some(stage) = await_signal(&device_ready, monitor.spawn()?)? {
        let outcome = stage.join()?;
        debug!(trace_id = %trace_id, outcome = ?outcome, "readiness stage finished");
    }
    device_ready.clear();

    // A soft readiness timeout can leave the device still booting.
    bridge.wait_for_device(device.serial())?;
    let installed = ensure_installed(bridge.as_ref(), &device, &config.launcher, fetch, trace_id)?;
    debug!(trace_id = %trace_id, outcome = ?installed, "install stage finished");

    let server_ready = Arc::new(ReadinessSignal::new());
    let (server_control, server_stage) = ServerStage::new(
        Arc::clone(&bridge),
        Arc::clone(&device),
        config.server.port,
        &config.launcher.server_device_path,
        Arc::clone(&server_ready),
        trace_id,
    )
    .spawn()?;
    let server_stage = await_signal(&server_ready, server_stage)?;
    thread::sleep(SERVER_WARMUP);

    Ok(BringUp {
        device,
        server_control,
        server_stage,
    })
}

/// Full bring-up: device, readiness, server, session. Returns once the
/// operator closes the control channel and everything has been stopped.
pub fn launch(mut config: AppConfig, config_path: &Path, trace_id: &str) -> Result<(), AppError> {
    let fetch = UreqFetch::new(Duration::from_secs(config.launcher.request_timeout_secs));
    let adb_program = prepare_adb(&config, &fetch, trace_id)?;
    info!(trace_id = %trace_id, adb = %adb_program, "Using adb");

    let bridge: Arc<dyn DeviceBridge> = Arc::new(AdbBridge::new(adb_program, trace_id));
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    let running = bring_up(bridge, &fetch, &mut config, config_path, &mut input, &mut output, trace_id)?;

    let auxiliary = start_auxiliary(&config.launcher.auxiliary_command, trace_id)?;

    let session = run_session(
        SessionRequest {
            device: &running.device,
            config: &mut config,
            config_path,
            fetch: &fetch,
            sink: Arc::new(LogSink::new(trace_id)),
            trace_id,
        },
        &mut input,
    );

    if let Some(auxiliary) = auxiliary {
        if !auxiliary.is_running() {
            warn!(trace_id = %trace_id, "auxiliary server exited before the session ended");
        }
        if let Err(err) = auxiliary.stop() {
            warn!(trace_id = %trace_id, error = %err, "auxiliary server did not stop cleanly");
        }
    }
    running.shutdown(trace_id);

    let summary = session?;
    info!(
        trace_id = %trace_id,
        pid = summary.pid,
        package = %summary.target.package,
        scripts = ?summary.scripts,
        "Session ended"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::runner::CommandOutput;
    use crate::app::http::testing::StaticFetch;
    use crate::app::testing::FakeBridge;
    use std::fs;
    use std::io::Cursor;

    const STALE: &str = "\
tcp6       0      0 :::8080          :::*        LISTEN   567/system_server
";
    const RUNNING: &str = "\
tcp        0      0 0.0.0.0:27042    0.0.0.0:*   LISTEN   4321/frida-server
tcp6       0      0 :::8080          :::*        LISTEN   567/system_server
";
    const CONNECTED: &str = "\
Active default network: 100
Current Networks:
  NetworkAgentInfo{ ni{[type: WIFI[], state: CONNECTED/CONNECTED, reason: (unspecified)]}  network{100}  nethandle{1} }
";
    const MARKER: &str = "test -f /data/local/tmp/frida-server && echo True";

    fn config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.launcher.candidate_ports = vec![7555];
        config.launcher.reboot_settle_secs = 0;
        config.launcher.server_cache_dir = dir.to_string_lossy().to_string();
        config
    }

    #[test]
    fn zero_wait_polls_forever() {
        let policy = device_wait_policy(0);
        assert_eq!(policy.max_elapsed, None);
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn positive_wait_sets_deadline() {
        assert_eq!(device_wait_policy(45).max_elapsed, Some(Duration::from_secs(45)));
    }

    #[cfg(unix)]
    #[test]
    fn stages_run_in_order_and_tunnel_is_up_on_return() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let bridge = Arc::new(
            FakeBridge::new()
                .with_devices(&["A"])
                .on_shell("netstat", STALE)
                .on_shell("dumpsys connectivity", CONNECTED)
                .on_shell(MARKER, "True\n")
                .spawn_with("sleep 30"),
        );
        let mut config = config(dir.path());
        let mut input = Cursor::new(Vec::<u8>::new());
        let mut output: Vec<u8> = Vec::new();

        let running = bring_up(
            Arc::clone(&bridge) as Arc<dyn DeviceBridge>,
            &StaticFetch::default(),
            &mut config,
            &config_path,
            &mut input,
            &mut output,
            "t",
        )
        .unwrap();

        let expected = vec![
            "kill-server",
            "start-server",
            "connect 127.0.0.1:7555",
            "devices",
            "shell A netstat -tlnp",
            "reboot A",
            "shell A dumpsys connectivity",
            "wait-for-device A",
            "shell A test -f /data/local/tmp/frida-server && echo True",
            "kill-server",
            "start-server",
            "root A",
            "wait-for-device A",
            "reverse A tcp:8443",
        ];
        let calls = bridge.calls();
        assert!(calls.len() >= expected.len());
        assert_eq!(&calls[..expected.len()], expected.as_slice());
        assert_eq!(running.device.serial(), "A");
        assert!(output.is_empty());
        assert!(!config_path.exists());

        running.shutdown("t");
        assert_eq!(bridge.count_calls("spawn A /data/local/tmp/frida-server"), 1);
    }

    #[cfg(unix)]
    #[test]
    fn remembered_choice_is_saved_before_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config").join("config.json");
        let bridge = Arc::new(
            FakeBridge::new()
                .with_devices(&["A", "B"])
                .on_shell("netstat", RUNNING)
                .on_shell(MARKER, "True\n"),
        );
        let mut config = config(dir.path());
        let mut input = Cursor::new(b"2\ny\n".to_vec());
        let mut output: Vec<u8> = Vec::new();

        let running = bring_up(
            Arc::clone(&bridge) as Arc<dyn DeviceBridge>,
            &StaticFetch::default(),
            &mut config,
            &config_path,
            &mut input,
            &mut output,
            "t",
        )
        .unwrap();
        running.shutdown("t");

        assert_eq!(config.user_config.default_device, "B");
        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(saved["userConfig"]["defaultDevice"], "B");
        assert_eq!(bridge.count_calls("reboot"), 0);
        assert_eq!(bridge.count_calls("reverse B tcp:8443"), 1);
    }

    #[test]
    fn failed_install_never_starts_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(
            FakeBridge::new()
                .with_devices(&["A"])
                .on_shell("netstat", RUNNING)
                .on_shell_output(
                    "test -f",
                    CommandOutput {
                        stdout: String::new(),
                        stderr: "error: device offline".to_string(),
                        exit_code: Some(1),
                    },
                ),
        );
        let mut config = config(dir.path());

        let err = bring_up(
            Arc::clone(&bridge) as Arc<dyn DeviceBridge>,
            &StaticFetch::default(),
            &mut config,
            &dir.path().join("config.json"),
            &mut Cursor::new(Vec::<u8>::new()),
            &mut Vec::<u8>::new(),
            "t",
        )
        .err()
        .expect("install fails");

        assert_eq!(err.code, "ERR_DEPENDENCY");
        assert_eq!(bridge.count_calls("wait-for-device A"), 1);
        assert_eq!(bridge.count_calls("reverse"), 0);
        assert_eq!(bridge.count_calls("spawn"), 0);
    }
}
