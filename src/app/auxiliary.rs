use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::locator::is_bare_program;
use crate::app::adb::runner::spawn_logged;
use crate::app::error::AppError;
use crate::app::supervisor::{ChildControl, ChildExit, StageHandle};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The optional local server process that runs beside the session.
pub struct AuxiliaryHandle {
    control: ChildControl,
    stage: StageHandle<ChildExit>,
}

impl AuxiliaryHandle {
    pub fn is_running(&self) -> bool {
        !self.stage.is_finished()
    }

    pub fn stop(self) -> Result<ChildExit, AppError> {
        self.control.stop();
        self.stage.join()
    }
}

/// Starts `command` (whitespace-separated program and arguments) under
/// supervision. A missing or unspawnable program is logged and skipped.
pub fn start_auxiliary(command: &str, trace_id: &str) -> Result<Option<AuxiliaryHandle>, AppError> {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Ok(None);
    };
    let args: Vec<String> = parts.map(str::to_string).collect();

    if !is_bare_program(program) && !Path::new(program).is_file() {
        warn!(trace_id = %trace_id, program = %program, "Auxiliary server not found; continuing without it");
        return Ok(None);
    }
    let child = match spawn_logged(program, &args, "auxiliary", trace_id) {
        Ok(child) => child,
        Err(err) => {
            warn!(trace_id = %trace_id, program = %program, error = %err, "Auxiliary server failed to start; continuing without it");
            return Ok(None);
        }
    };
    info!(trace_id = %trace_id, program = %program, pid = child.id(), "Auxiliary server started");

    let control = ChildControl::new();
    control.install(child);
    let watcher = control.clone();
    let stage_trace = trace_id.to_string();
    let stage = StageHandle::spawn("auxiliary", trace_id, move || {
        let exit = watcher.supervise(EXIT_POLL_INTERVAL);
        if !exit.stopped {
            warn!(trace_id = %stage_trace, exit_code = ?exit.code, "Auxiliary server exited");
        }
        Ok(exit)
    })?;
    Ok(Some(AuxiliaryHandle { control, stage }))
}
