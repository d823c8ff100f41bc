// Registry configuration
//
// The registry is enabled only when at least one coordination store address
// is configured. TTLs are whole seconds, as the store counts them.

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

/// Root prefix of every registry key
pub const DEFAULT_PREFIX: &str = "beehive";

/// Default TTL of a hive registration entry
pub const DEFAULT_HIVE_TTL: Duration = Duration::from_secs(60);

/// Default TTL of shard ownership entries (zero means no expiry)
pub const DEFAULT_APP_TTL: Duration = Duration::ZERO;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Coordination store addresses. Empty disables the registry.
    pub addrs: Vec<String>,
    pub prefix: String,
    pub hive_ttl: Duration,
    pub app_ttl: Duration,
    /// Report an `expire` of a hive entry as `HiveLeft`.
    pub expire_as_leave: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            hive_ttl: DEFAULT_HIVE_TTL,
            app_ttl: DEFAULT_APP_TTL,
            expire_as_leave: false,
        }
    }
}

impl RegistryConfig {
    pub fn with_addrs<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.addrs.is_empty()
    }

    /// How often the hive entry is refreshed: half the TTL, at least a second.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs((self.hive_ttl.as_secs() / 2).max(1))
    }

    /// TTL of the hive entry. Zero means the entry never expires.
    pub fn hive_ttl_opt(&self) -> Option<Duration> {
        non_zero(self.hive_ttl)
    }

    pub fn app_ttl_opt(&self) -> Option<Duration> {
        non_zero(self.app_ttl)
    }

    /// Loads the configuration from `BH_*` environment variables, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addrs) = lookup("BH_REG_ADDRS") {
            config.addrs = addrs
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(prefix) = lookup("BH_REG_PREFIX") {
            config.prefix = prefix;
        }
        if let Some(ttl) = lookup("BH_HIVE_TTL_SECS") {
            config.hive_ttl = parse_secs("BH_HIVE_TTL_SECS", &ttl)?;
        }
        if let Some(ttl) = lookup("BH_APP_TTL_SECS") {
            config.app_ttl = parse_secs("BH_APP_TTL_SECS", &ttl)?;
        }
        if let Some(flag) = lookup("BH_EXPIRE_AS_LEAVE") {
            config.expire_as_leave = matches!(flag.trim(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}

fn non_zero(ttl: Duration) -> Option<Duration> {
    if ttl.is_zero() {
        None
    } else {
        Some(ttl)
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}
