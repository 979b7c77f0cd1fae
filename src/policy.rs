//! Per-IP abuse policy: bans, connection limiting and malformed-request
//! accounting. The gate runs before any protocol parsing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::PolicyConfig;
use crate::util;

pub trait Policy: Send + Sync {
    fn is_banned(&self, ip: &str) -> bool;
    /// False means the IP exhausted its connection allowance and must be
    /// rejected at accept.
    fn apply_limit(&self, ip: &str) -> bool;
    fn ban(&self, ip: &str);
    fn record_malformed(&self, ip: &str);
}

/// In-memory policy store: timed bans, a per-IP connection allowance that
/// refills on an interval, and a malformed counter that elevates to a ban.
pub struct StandardPolicy {
    banning_enabled: bool,
    ban_timeout: Duration,
    malformed_limit: u32,
    limits_enabled: bool,
    limit: i64,
    limit_jump: i64,
    banned: Mutex<HashMap<String, Instant>>,
    malformed: Mutex<HashMap<String, u32>>,
    allowance: Mutex<HashMap<String, i64>>,
}

impl StandardPolicy {
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            banning_enabled: config.banning.enabled,
            ban_timeout: util::parse_duration(&config.banning.timeout)?,
            malformed_limit: config.banning.malformed_limit,
            limits_enabled: config.limits.enabled,
            limit: config.limits.limit,
            limit_jump: config.limits.limit_jump,
            banned: Mutex::new(HashMap::new()),
            malformed: Mutex::new(HashMap::new()),
            allowance: Mutex::new(HashMap::new()),
        })
    }

    /// Hand connection allowance back to every tracked IP on a fixed cadence.
    pub fn start_refill(self: &Arc<Self>, every: Duration) {
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                policy.refill();
            }
        });
    }

    fn refill(&self) {
        let limit = self.limit;
        let jump = self.limit_jump;
        let mut allowance = self.allowance.lock().unwrap();
        allowance.retain(|_, v| *v < limit);
        for v in allowance.values_mut() {
            *v = (*v + jump).min(limit);
        }
    }

    #[cfg(test)]
    fn refill_now(&self) {
        self.refill();
    }
}

impl Policy for StandardPolicy {
    fn is_banned(&self, ip: &str) -> bool {
        if !self.banning_enabled {
            return false;
        }
        let mut banned = self.banned.lock().unwrap();
        match banned.get(ip) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                banned.remove(ip);
                info!("ban expired for {}", ip);
                false
            }
            None => false,
        }
    }

    fn apply_limit(&self, ip: &str) -> bool {
        if !self.limits_enabled {
            return true;
        }
        let mut allowance = self.allowance.lock().unwrap();
        let remaining = allowance.entry(ip.to_string()).or_insert(self.limit);
        if *remaining <= 0 {
            warn!("connection limit reached for {}", ip);
            return false;
        }
        *remaining -= 1;
        true
    }

    fn ban(&self, ip: &str) {
        if !self.banning_enabled {
            return;
        }
        warn!("banning {} for {:?}", ip, self.ban_timeout);
        self.banned
            .lock()
            .unwrap()
            .insert(ip.to_string(), Instant::now() + self.ban_timeout);
    }

    fn record_malformed(&self, ip: &str) {
        let count = {
            let mut malformed = self.malformed.lock().unwrap();
            let count = malformed.entry(ip.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.malformed_limit {
            warn!("{} malformed requests from {}", count, ip);
            self.ban(ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn policy() -> StandardPolicy {
        let mut config = PolicyConfig::default();
        config.banning.timeout = "1h".to_string();
        config.banning.malformed_limit = 3;
        config.limits.limit = 2;
        config.limits.limit_jump = 1;
        StandardPolicy::new(&config).unwrap()
    }

    #[test]
    fn ban_and_lookup() {
        let p = policy();
        assert!(!p.is_banned("1.2.3.4"));
        p.ban("1.2.3.4");
        assert!(p.is_banned("1.2.3.4"));
        assert!(!p.is_banned("4.3.2.1"));
    }

    #[test]
    fn malformed_requests_elevate_to_ban() {
        let p = policy();
        p.record_malformed("1.2.3.4");
        p.record_malformed("1.2.3.4");
        assert!(!p.is_banned("1.2.3.4"));
        p.record_malformed("1.2.3.4");
        assert!(p.is_banned("1.2.3.4"));
    }

    #[test]
    fn limit_exhausts_and_refills() {
        let p = policy();
        assert!(p.apply_limit("1.2.3.4"));
        assert!(p.apply_limit("1.2.3.4"));
        assert!(!p.apply_limit("1.2.3.4"));
        p.refill_now();
        assert!(p.apply_limit("1.2.3.4"));
        assert!(!p.apply_limit("1.2.3.4"));
    }

    #[test]
    fn disabled_banning_never_bans() {
        let mut config = PolicyConfig::default();
        config.banning.enabled = false;
        let p = StandardPolicy::new(&config).unwrap();
        p.ban("1.2.3.4");
        assert!(!p.is_banned("1.2.3.4"));
    }
}
