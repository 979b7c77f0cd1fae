//! Gateway configuration, loaded from a JSON file with camelCase keys.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub name: String,
    /// Algorithm tag advertised in NiceHash job pushes.
    pub algo: String,
    pub proxy: ProxyConfig,
    pub upstream: Vec<UpstreamConfig>,
    pub upstream_check_interval: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "ethergate".to_string(),
            algo: "etchash".to_string(),
            proxy: ProxyConfig::default(),
            upstream: Vec::new(),
            upstream_check_interval: "5s".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Static pool share difficulty.
    pub difficulty: i64,
    pub block_refresh_interval: String,
    pub state_update_interval: String,
    pub hashrate_expiration: String,
    pub stratum_hostname: String,
    pub health_check: bool,
    pub max_fails: i64,
    pub policy: PolicyConfig,
    pub stratum: StratumConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            difficulty: 2_000_000_000,
            block_refresh_interval: "120ms".to_string(),
            state_update_interval: "3s".to_string(),
            hashrate_expiration: "3h".to_string(),
            stratum_hostname: "localhost".to_string(),
            health_check: true,
            max_fails: 100,
            policy: PolicyConfig::default(),
            stratum: StratumConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct StratumConfig {
    pub enabled: bool,
    pub listen: String,
    /// Idle deadline per connection, refreshed on every parsed frame.
    pub timeout: String,
    pub max_conn: usize,
    pub tls: bool,
    pub cert_file: String,
    pub key_file: String,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:8008".to_string(),
            timeout: "15m".to_string(),
            max_conn: 8192,
            tls: false,
            cert_file: String::new(),
            key_file: String::new(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub banning: BanningConfig,
    pub limits: LimitsConfig,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct BanningConfig {
    pub enabled: bool,
    pub timeout: String,
    /// Malformed requests tolerated from one IP before it is banned.
    pub malformed_limit: u32,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: "3h".to_string(),
            malformed_limit: 5,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    pub enabled: bool,
    /// Connection allowance per IP.
    pub limit: i64,
    /// Refill period for the allowance.
    pub grace: String,
    /// Allowance given back per refill tick.
    pub limit_jump: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 100,
            grace: "5m".to_string(),
            limit_jump: 10,
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    pub timeout: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path))?;
        Ok(config)
    }
}
