//! Diagnostic dumps of relayed traffic.
//!
//! None of these affect what goes over the wire.

use hyper::HeaderMap;
use tracing::info;

/// Which parts of the relayed traffic get logged.
#[derive(Debug, Clone, Copy)]
pub struct DumpConfig {
    pub headers: bool,
    pub bodies: bool,
    pub mappolls: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            headers: true,
            bodies: true,
            mappolls: true,
        }
    }
}

impl DumpConfig {
    pub fn headers(&self, headers: &HeaderMap) {
        if !self.headers {
            return;
        }
        for name in headers.keys() {
            let values: Vec<_> = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            info!("  {}: {}", name, values.join(", "));
        }
    }

    pub fn body(&self, body: &[u8], label: &str) {
        if self.bodies {
            log_val(body, label);
        }
    }
}

/// Log a payload, pretty-printing it when it is a JSON object.
pub fn log_val(val: &[u8], label: &str) {
    info!("{}: {}", label, render(val));
}

fn render(val: &[u8]) -> String {
    if val.is_empty() {
        return "<empty>".to_string();
    }

    if val[0] == b'{' {
        if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(val) {
            if let Ok(pretty) = serde_json::to_string_pretty(&parsed) {
                return pretty;
            }
        }
    }

    format!("{:?}", String::from_utf8_lossy(val))
}
