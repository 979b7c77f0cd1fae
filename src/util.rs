//! Hex, difficulty and duration helpers shared across the gateway.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use primitive_types::U256;
use rand::Rng;

/// Random lowercase hex string of `len` characters.
///
/// Draws from the process-wide thread RNG, which is seeded once from the OS;
/// hot paths (job ids, extranonces) must never reseed per call.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; (len + 1) / 2];
    rand::thread_rng().fill(&mut bytes[..]);
    let mut out = hex::encode(bytes);
    out.truncate(len);
    out
}

pub fn to_hex(n: u64) -> String {
    format!("0x{:x}", n)
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Ensure a hex string carries the `0x` prefix.
pub fn hex_0x(s: &str) -> String {
    if s.starts_with("0x") {
        s.to_string()
    } else {
        format!("0x{}", s)
    }
}

/// Difficulty sent in `mining.set_difficulty`: pool difficulty scaled down by
/// 2^32, the conventional ethash translation.
pub fn diff_to_float(diff: i64) -> f64 {
    diff.max(1) as f64 / 4_294_967_296.0
}

/// Share target for the `eth_getWork` boundary slot: (2^256 - 1) / diff,
/// rendered as a 0x-prefixed 64-digit hex string.
pub fn target_hex(diff: i64) -> String {
    let target = U256::MAX / U256::from(diff.max(1) as u64);
    format!("0x{:064x}", target)
}

/// Human-readable hashrate for log lines.
pub fn format_hashrate(rate: i64) -> String {
    const UNITS: [&str; 6] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut value = rate as f64;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && value >= 1000.0 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Parse duration strings of the `"500ms"` / `"10s"` / `"15m"` / `"3h"` form
/// used throughout the config file.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let unit_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow!("duration {:?} is missing a unit", s))?;
    let (number, unit) = s.split_at(unit_at);
    let value: f64 = number
        .parse()
        .map_err(|_| anyhow!("bad duration value {:?}", s))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => bail!("unknown duration unit {:?} in {:?}", unit, s),
    };
    Ok(Duration::from_secs_f64(secs))
}
