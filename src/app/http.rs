use std::io::Read;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::app::error::AppError;

const USER_AGENT: &str = concat!("doctorate-launcher/", env!("CARGO_PKG_VERSION"));
const MAX_BODY_BYTES: u64 = 512 * 1024 * 1024;

/// Blocking HTTP downloads used by the installers.
pub trait HttpFetch: Send + Sync {
    fn get_bytes(&self, url: &str, trace_id: &str) -> Result<Vec<u8>, AppError>;

    fn get_json(&self, url: &str, trace_id: &str) -> Result<Value, AppError> {
        let body = self.get_bytes(url, trace_id)?;
        serde_json::from_slice(&body).map_err(|err| {
            AppError::network(format!("Invalid JSON from {url}: {err}"), trace_id)
        })
    }
}

pub struct UreqFetch {
    agent: ureq::Agent,
}

impl UreqFetch {
    /// `timeout` bounds connecting and each read, not the whole transfer.
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .redirects(8)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }
}

impl HttpFetch for UreqFetch {
    fn get_bytes(&self, url: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        info!(trace_id = %trace_id, url = %url, "http get");
        let response = self.agent.get(url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                AppError::network(format!("GET {url} returned HTTP {code}"), trace_id)
            }
            other => AppError::network(format!("GET {url} failed: {other}"), trace_id),
        })?;
        read_body(response.into_reader(), MAX_BODY_BYTES, url, trace_id)
    }
}

fn read_body(reader: impl Read, limit: u64, url: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
    let mut body = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut body)
        .map_err(|err| AppError::network(format!("Failed to read body of {url}: {err}"), trace_id))?;
    if body.len() as u64 > limit {
        return Err(AppError::network(
            format!("Body of {url} exceeds {limit} bytes"),
            trace_id,
        ));
    }
    Ok(body)
}
