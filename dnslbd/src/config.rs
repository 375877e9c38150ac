use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use serde::Deserialize;

use crate::upstream::Policy;

const ENV_CONFIG_PATH: &str = "DNSLB_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub balancing: BalancingConfig,
    #[serde(default)]
    pub frontends: Vec<FrontendConfig>,
    #[serde(default)]
    pub forwarders: Vec<ForwarderConfig>,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `DNSLB_CONFIG` environment variable.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let path = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => PathBuf::from(p),
            Err(_) => path.to_path_buf(),
        };
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runtime.workers == 0 {
            bail!("runtime.workers must be at least 1");
        }
        if self.runtime.max_pkt_size < 512 {
            bail!("runtime.max_pkt_size below the DNS minimum of 512");
        }
        if self.runtime.epoch_ms == 0 {
            bail!("runtime.epoch_ms must be positive");
        }
        if self.runtime.req_ttl_ms == 0 {
            bail!("runtime.req_ttl_ms must be positive");
        }
        if self.runtime.gc_interval_ms == 0 {
            bail!("runtime.gc_interval_ms must be positive");
        }
        if self.watchdog.interval_ms == 0 {
            bail!("watchdog.interval_ms must be positive");
        }
        if self.frontends.is_empty() {
            bail!("no frontends configured");
        }
        if self.forwarders.is_empty() {
            bail!("no forwarders configured");
        }
        for (i, fwd) in self.forwarders.iter().enumerate() {
            if self.forwarders[..i].iter().any(|f| f.name == fwd.name) {
                bail!("duplicate forwarder name {}", fwd.name);
            }
        }
        for fe in &self.frontends {
            if fe.forwarders.is_empty() {
                bail!("frontend {} has no forwarders", fe.name);
            }
            for name in &fe.forwarders {
                if !self.forwarders.iter().any(|f| &f.name == name) {
                    bail!("frontend {} references unknown forwarder {}", fe.name, name);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_pkt_size")]
    pub max_pkt_size: usize,
    /// How long an unanswered query stays tracked.
    #[serde(default = "default_req_ttl_ms")]
    pub req_ttl_ms: u64,
    /// Coarse timestamp granularity.
    #[serde(default = "default_epoch_ms")]
    pub epoch_ms: u64,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    /// Grace period for in-flight work after a shutdown or reload.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_pkt_size: default_max_pkt_size(),
            req_ttl_ms: default_req_ttl_ms(),
            epoch_ms: default_epoch_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_max_pkt_size() -> usize {
    4096
}
fn default_req_ttl_ms() -> u64 {
    10_000
}
fn default_epoch_ms() -> u64 {
    100
}
fn default_gc_interval_ms() -> u64 {
    1_000
}
fn default_drain_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_wdt_interval_ms")]
    pub interval_ms: u64,
    /// Unanswered probes tolerated before a forwarder counts as dead.
    #[serde(default = "default_wdt_retries")]
    pub retries: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_wdt_interval_ms(),
            retries: default_wdt_retries(),
        }
    }
}

fn default_wdt_interval_ms() -> u64 {
    1_000
}
fn default_wdt_retries() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BalancingConfig {
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontendConfig {
    pub name: String,
    pub listen: SocketAddr,
    pub forwarders: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForwarderConfig {
    pub name: String,
    pub address: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_watchdog_query")]
    pub watchdog_query: String,
}

fn default_weight() -> u32 {
    1
}
fn default_watchdog_query() -> String {
    "example.com.".to_string()
}
