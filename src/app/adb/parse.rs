use regex::Regex;

use crate::app::models::{ConnectivityStatus, DeviceSummary, ListeningSocket, ServiceTable};

pub const STABLE_SERVICE_MARKERS: &[&str] = &["system_server"];
pub const INSTRUMENTATION_SERVER_MARKER: &str = "frida-server";

pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            let serial = tokens[0].to_string();
            let state = tokens[1].to_string();
            let mut model = None;
            let mut product = None;
            let mut device = None;
            let mut transport_id = None;
            for token in tokens.iter().skip(2) {
                if let Some(value) = token.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("product:") {
                    product = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("device:") {
                    device = Some(value.to_string());
                } else if let Some(value) = token.strip_prefix("transport_id:") {
                    transport_id = Some(value.to_string());
                }
            }
            Some(DeviceSummary {
                serial,
                state,
                model,
                product,
                device,
                transport_id,
            })
        })
        .collect()
}

/// Parse `netstat -tlnp` (BusyBox or toybox) into listening sockets.
///
/// Expected rows:
/// - `tcp   0   0 0.0.0.0:27042   0.0.0.0:*   LISTEN   4321/frida-server`
pub fn parse_listening_programs(output: &str) -> Vec<ListeningSocket> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let proto = *tokens.first()?;
            if !(proto.starts_with("tcp") || proto.starts_with("udp")) {
                return None;
            }
            let local_address = tokens.get(3)?.to_string();
            let last = *tokens.last()?;
            let (pid, program) = match last.split_once('/') {
                Some((pid, program)) => (pid.parse::<u32>().ok(), program.to_string()),
                None => (None, String::new()),
            };
            Some(ListeningSocket {
                proto: proto.to_string(),
                local_address,
                pid,
                program,
            })
        })
        .collect()
}

pub fn classify_service_table(output: &str) -> ServiceTable {
    let sockets = parse_listening_programs(output);
    let named: Vec<&str> = sockets
        .iter()
        .map(|socket| socket.program.as_str())
        .filter(|program| !program.is_empty())
        .collect();

    let has = |marker: &str| {
        if named.is_empty() {
            // Unparseable layout (or no root to resolve owners): fall back to a text scan.
            output.contains(marker)
        } else {
            named.iter().any(|program| program.starts_with(marker))
        }
    };

    ServiceTable {
        stable_services: STABLE_SERVICE_MARKERS.iter().any(|marker| has(marker)),
        instrumentation_server: has(INSTRUMENTATION_SERVER_MARKER),
    }
}

/// Extract the default network and its `state: X/Y` token from `dumpsys connectivity`.
pub fn parse_connectivity_dump(output: &str) -> ConnectivityStatus {
    let Ok(default_re) = Regex::new(r"(?mi)^\s*(?:active|current) default network:\s*(\S+)") else {
        return ConnectivityStatus::default();
    };
    let Ok(state_re) = Regex::new(r"state:\s*([A-Z_]+/[A-Z_]+)") else {
        return ConnectivityStatus::default();
    };

    let Some(caps) = default_re.captures(output) else {
        return ConnectivityStatus::default();
    };
    let network = caps[1].trim_end_matches(',').to_string();
    if network.eq_ignore_ascii_case("none") || network.eq_ignore_ascii_case("null") {
        return ConnectivityStatus::default();
    }
    let block_start = caps.get(0).map(|m| m.end()).unwrap_or(0);
    let block = &output[block_start..];

    let agent_markers = [format!("network{{{network}}}"), format!("- {network}]")];
    let agent_state = block
        .lines()
        .filter(|line| line.contains("NetworkAgentInfo"))
        .filter(|line| agent_markers.iter().any(|marker| line.contains(marker.as_str())))
        .find_map(|line| state_re.captures(line).map(|caps| caps[1].to_string()));

    let state = agent_state.or_else(|| {
        state_re
            .captures(block)
            .map(|caps| caps[1].to_string())
    });

    ConnectivityStatus {
        default_network: Some(network),
        state,
    }
}

/// Map `ro.product.cpu.abi` to the architecture names used by release artifacts.
pub fn normalize_abi(raw: &str) -> String {
    let abi = raw.trim().replace("-v8a", "");
    if abi.starts_with("armeabi") {
        "arm".to_string()
    } else {
        abi
    }
}

/// `test -f PATH && echo True` prints `True` only when the file exists.
pub fn parse_marker_echo(output: &str) -> bool {
    output.lines().any(|line| line.trim() == "True")
}
