use std::time::Instant;

use chrono::Utc;
use doctorate_launcher_lib::app::adb::bridge::{device_abi, device_file_exists, AdbBridge, DeviceBridge};
use doctorate_launcher_lib::app::adb::locator::{resolve_adb_program, validate_adb_program};
use doctorate_launcher_lib::app::adb::parse::{classify_service_table, parse_connectivity_dump};
use doctorate_launcher_lib::app::config::{config_path, load_config_from_path};
use doctorate_launcher_lib::app::error::AppError;
use doctorate_launcher_lib::app::models::Device;
use doctorate_launcher_lib::app::session::attach::resolve_target;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    serial: Option<String>,
    json: bool,
}

#[derive(Serialize)]
struct PreflightSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    generated_at: String,
    serial: Option<String>,
    adb_program: Option<String>,
    checks: Vec<PreflightCheck>,
}

#[derive(Serialize)]
struct PreflightCheck {
    name: &'static str,
    status: &'static str, // pass|fail|warn
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--json" => {
                json = true;
            }
            "-h" | "--help" => {
                return Err("Usage: preflight [--serial SERIAL] [--json]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(Args { serial, json })
}

/// Records one check; `warn` marks failures that do not fail the run.
fn run_check<F>(checks: &mut Vec<PreflightCheck>, name: &'static str, warn: bool, f: F) -> Option<Value>
where
    F: FnOnce() -> Result<Value, AppError>,
{
    let start = Instant::now();
    match f() {
        Ok(detail) => {
            checks.push(PreflightCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                detail: Some(detail.clone()),
                error_code: None,
                error: None,
            });
            Some(detail)
        }
        Err(err) => {
            checks.push(PreflightCheck {
                name,
                status: if warn { "warn" } else { "fail" },
                duration_ms: start.elapsed().as_millis(),
                detail: None,
                error_code: Some(err.code),
                error: Some(err.error),
            });
            None
        }
    }
}

fn pick_serial(
    requested: Option<String>,
    remembered: &str,
    online: &[String],
    trace_id: &str,
) -> Result<String, AppError> {
    if let Some(serial) = requested {
        if online.contains(&serial) {
            return Ok(serial);
        }
        return Err(AppError::validation(format!("Device {serial} is not online"), trace_id));
    }
    match online {
        [] => Err(AppError::dependency("No online adb devices found.", trace_id)),
        [only] => Ok(only.clone()),
        _ if online.iter().any(|serial| serial == remembered) => Ok(remembered.to_string()),
        _ => Err(AppError::validation(
            format!(
                "Multiple online devices found ({}). Set ANDROID_SERIAL or pass --serial.",
                online.join(", ")
            ),
            trace_id,
        )),
    }
}

fn print_text(summary: &PreflightSummary) {
    println!("preflight {} (trace {})", summary.status, summary.trace_id);
    if let Some(serial) = &summary.serial {
        println!("device: {serial}");
    }
    for check in &summary.checks {
        let detail = match (&check.detail, &check.error) {
            (_, Some(error)) => error.clone(),
            (Some(detail), None) => detail.to_string(),
            (None, None) => String::new(),
        };
        println!(
            "  [{}] {} ({} ms) {}",
            check.status, check.name, check.duration_ms, detail
        );
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let mut checks: Vec<PreflightCheck> = Vec::new();
    let mut serial: Option<String> = None;
    let mut adb_program: Option<String> = None;

    let path = config_path();
    let started = Instant::now();
    let config = match load_config_from_path(&path, &trace_id) {
        Ok(config) => {
            checks.push(PreflightCheck {
                name: "load_config",
                status: "pass",
                duration_ms: started.elapsed().as_millis(),
                detail: Some(json!({ "path": path.display().to_string(), "mode": config.server.mode })),
                error_code: None,
                error: None,
            });
            Some(config)
        }
        Err(err) => {
            checks.push(PreflightCheck {
                name: "load_config",
                status: "fail",
                duration_ms: started.elapsed().as_millis(),
                detail: None,
                error_code: Some(err.code),
                error: Some(err.error),
            });
            None
        }
    };

    if let Some(config) = config {
        let program = resolve_adb_program(&config.launcher.adb_path);
        adb_program = Some(program.clone());

        run_check(&mut checks, "target", false, || {
            let target = resolve_target(&config.server, &trace_id)?;
            serde_json::to_value(target)
                .map_err(|err| AppError::system(format!("Failed to serialize target: {err}"), &trace_id))
        });

        let adb_ok = run_check(&mut checks, "adb_program", false, || {
            validate_adb_program(&program).map_err(|msg| AppError::dependency(msg, &trace_id))?;
            Ok(json!({ "program": program }))
        })
        .is_some();

        if adb_ok {
            let bridge = AdbBridge::new(program.clone(), &trace_id);
            let picked = run_check(&mut checks, "devices", false, || {
                let online: Vec<String> = bridge
                    .devices()?
                    .into_iter()
                    .filter(|device| device.is_online())
                    .map(|device| device.serial)
                    .collect();
                let picked = pick_serial(
                    args.serial.clone(),
                    &config.user_config.default_device,
                    &online,
                    &trace_id,
                )?;
                Ok(json!({ "online": online, "selected": picked }))
            });
            serial = picked
                .as_ref()
                .and_then(|detail| detail["selected"].as_str())
                .map(str::to_string);

            if let Some(selected) = serial.clone() {
                let device = Device::new(selected.clone());

                run_check(&mut checks, "abi", false, || {
                    Ok(json!({ "abi": device_abi(&bridge, &device, &trace_id)? }))
                });
                run_check(&mut checks, "service_table", true, || {
                    let output = bridge.shell(&selected, "netstat -tlnp")?;
                    let table = classify_service_table(&output.stdout);
                    if table.needs_reboot() {
                        return Err(AppError::dependency(
                            "system services are up without frida-server; the launcher will reboot the device",
                            &trace_id,
                        ));
                    }
                    Ok(json!(table))
                });
                run_check(&mut checks, "connectivity", true, || {
                    let output = bridge.shell(&selected, "dumpsys connectivity")?;
                    let status = parse_connectivity_dump(&output.stdout);
                    if !status.is_connected() {
                        return Err(AppError::dependency(
                            format!("default network is not connected ({:?})", status.state),
                            &trace_id,
                        ));
                    }
                    Ok(json!(status))
                });
                run_check(&mut checks, "frida_server_installed", true, || {
                    let path = config.launcher.server_device_path.as_str();
                    if device_file_exists(&bridge, &selected, path, &trace_id)? {
                        Ok(json!({ "path": path }))
                    } else {
                        Err(AppError::dependency(
                            format!("{path} is missing; the launcher will install it"),
                            &trace_id,
                        ))
                    }
                });
            }
        }
    }

    let status = if checks.iter().any(|check| check.status == "fail") {
        "fail"
    } else if checks.iter().any(|check| check.status == "warn") {
        "warn"
    } else {
        "pass"
    };
    let summary = PreflightSummary {
        tool: "doctorate_preflight",
        status,
        trace_id,
        generated_at: Utc::now().to_rfc3339(),
        serial,
        adb_program,
        checks,
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).unwrap_or_default()
        );
    } else {
        print_text(&summary);
    }
    if status == "fail" {
        std::process::exit(1);
    }
}
