//! Host characteristics reported to the client at connection time.

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceChars {
    pub isa: &'static str,
    /// CPU clock in Hz; 0 when unavailable.
    pub cpu_speed_hz: u64,
    /// Free memory in bytes; 0 when unavailable.
    pub free_memory: u64,
}

impl DeviceChars {
    pub fn probe() -> Self {
        let chars = DeviceChars {
            isa: std::env::consts::ARCH,
            cpu_speed_hz: cpu_freq_hz().unwrap_or(0),
            free_memory: free_mem_bytes().unwrap_or(0),
        };
        debug!(?chars, "probed device characteristics");
        chars
    }
}

/// Value after the ':' of the first line starting with `token`.
fn find_token(path: &str, token: &str) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    for line in text.lines() {
        if line.starts_with(token) {
            let (_, value) = line.split_once(':')?;
            return Some(value.trim().to_string());
        }
    }
    None
}

fn cpu_freq_hz() -> Option<u64> {
    let mhz: f64 = find_token("/proc/cpuinfo", "cpu MHz")?.parse().ok()?;
    Some((mhz * 1_000_000.0) as u64)
}

fn free_mem_bytes() -> Option<u64> {
    let value = find_token("/proc/meminfo", "MemFree")?;
    let mut parts = value.split_whitespace();
    let amount: u64 = parts.next()?.parse().ok()?;
    Some(match parts.next() {
        Some("kB") => amount * 1024,
        _ => amount,
    })
}
