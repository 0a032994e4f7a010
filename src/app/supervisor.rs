use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info};

use crate::app::error::AppError;
use crate::app::signal::ReadinessSignal;

const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A named background stage whose outcome stays observable after spawn.
pub struct StageHandle<T> {
    name: &'static str,
    trace_id: String,
    join: JoinHandle<Result<T, AppError>>,
}

impl<T: Send + 'static> StageHandle<T> {
    pub fn spawn<F>(name: &'static str, trace_id: &str, stage: F) -> Result<Self, AppError>
    where
        F: FnOnce() -> Result<T, AppError> + Send + 'static,
    {
        let stage_trace = trace_id.to_string();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let result = stage();
                if let Err(err) = &result {
                    error!(trace_id = %stage_trace, stage = name, error = %err, "stage failed");
                }
                result
            })
            .map_err(|err| {
                AppError::system(format!("Failed to spawn {name} stage: {err}"), trace_id)
            })?;
        Ok(Self {
            name,
            trace_id: trace_id.to_string(),
            join,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<T, AppError> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(AppError::system(
                format!("{} stage panicked", self.name),
                &self.trace_id,
            )),
        }
    }
}

/// Blocks until `signal` is set, or fails if `stage` terminates without setting it.
///
/// A stage that finishes successfully after setting the signal is joined here;
/// otherwise it keeps running and the handle is returned to the caller.
pub fn await_signal<T: Send + 'static>(
    signal: &ReadinessSignal,
    stage: StageHandle<T>,
) -> Result<Option<StageHandle<T>>, AppError> {
    loop {
        if signal.wait_timeout(SIGNAL_POLL_INTERVAL) {
            if stage.is_finished() {
                let name = stage.name();
                stage.join()?;
                info!(stage = name, "stage completed");
                return Ok(None);
            }
            return Ok(Some(stage));
        }
        if stage.is_finished() {
            let name = stage.name();
            let trace_id = stage.trace_id.clone();
            stage.join()?;
            if signal.is_set() {
                return Ok(None);
            }
            return Err(AppError::system(
                format!("{name} stage finished without signaling readiness"),
                trace_id,
            ));
        }
    }
}

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildExit {
    pub code: Option<i32>,
    /// True when the exit was requested through [`ChildControl::stop`].
    pub stopped: bool,
}

/// Shared stop switch for a stage that owns a long-running child process.
#[derive(Clone, Default)]
pub struct ChildControl {
    stop_flag: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
}

impl ChildControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the child to the control; a stop that already happened kills it at once.
    pub fn install(&self, child: Child) {
        let mut guard = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(child);
        if self.is_stopped() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let mut guard = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Blocks until the installed child exits or `stop` is called.
    pub fn supervise(&self, poll_interval: Duration) -> ChildExit {
        loop {
            if self.is_stopped() {
                return ChildExit { code: None, stopped: true };
            }
            let exit = {
                let mut guard = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let Some(child) = guard.as_mut() else {
                    return ChildExit { code: None, stopped: true };
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        Some(status.code())
                    }
                    Ok(None) => None,
                    Err(_) => {
                        guard.take();
                        Some(None)
                    }
                }
            };
            if let Some(code) = exit {
                return ChildExit { code, stopped: self.is_stopped() };
            }
            thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn await_signal_joins_completed_stage() {
        let signal = Arc::new(ReadinessSignal::new());
        let producer = Arc::clone(&signal);
        let stage = StageHandle::spawn("probe", "t", move || {
            producer.set();
            Ok(7)
        })
        .unwrap();
        while !stage.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        let remaining = await_signal(&signal, stage).unwrap();
        assert!(remaining.is_none());
    }

    #[test]
    fn await_signal_returns_running_stage() {
        let signal = Arc::new(ReadinessSignal::new());
        let producer = Arc::clone(&signal);
        let stage = StageHandle::spawn("server", "t", move || {
            producer.set();
            thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .unwrap();
        let remaining = await_signal(&signal, stage).unwrap().expect("still running");
        assert_eq!(remaining.name(), "server");
        remaining.join().unwrap();
    }

    #[test]
    fn await_signal_propagates_stage_failure() {
        let signal = ReadinessSignal::new();
        let stage: StageHandle<()> = StageHandle::spawn("install", "trace-3", || {
            Err(AppError::network("download failed", "trace-3"))
        })
        .unwrap();
        let err = await_signal(&signal, stage).unwrap_err();
        assert_eq!(err.code, "ERR_NETWORK");
        assert_eq!(err.trace_id, "trace-3");
    }

    #[test]
    fn await_signal_reports_silent_exit() {
        let signal = ReadinessSignal::new();
        let stage = StageHandle::spawn("quiet", "t", || Ok(())).unwrap();
        let err = await_signal(&signal, stage).unwrap_err();
        assert_eq!(err.code, "ERR_SYSTEM");
        assert!(err.error.contains("without signaling"));
    }

    #[test]
    fn join_maps_panics_to_errors() {
        let stage: StageHandle<()> = StageHandle::spawn("boom", "t", || panic!("boom")).unwrap();
        let err = stage.join().unwrap_err();
        assert_eq!(err.code, "ERR_SYSTEM");
        assert!(err.error.contains("panicked"));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Child {
        std::process::Command::new("sh").args(["-c", script]).spawn().unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn supervise_reports_natural_exit() {
        let control = ChildControl::new();
        control.install(sh("exit 3"));
        let exit = control.supervise(Duration::from_millis(10));
        assert_eq!(exit, ChildExit { code: Some(3), stopped: false });
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_running_child() {
        let control = ChildControl::new();
        control.install(sh("sleep 30"));
        let watcher = control.clone();
        let join = thread::spawn(move || watcher.supervise(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(50));
        control.stop();
        let exit = join.join().unwrap();
        assert!(exit.stopped);
    }

    #[cfg(unix)]
    #[test]
    fn install_after_stop_kills_immediately() {
        let control = ChildControl::new();
        control.stop();
        control.install(sh("sleep 30"));
        assert!(control.supervise(Duration::from_millis(10)).stopped);
    }
}
