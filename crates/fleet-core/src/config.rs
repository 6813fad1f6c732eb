//! fleet.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Name of the config file that marks a fleet root.
pub const CONFIG_FILE: &str = "fleet.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fleet-wide ceiling on live workers. `<= 0` turns governance off.
    #[serde(default = "default_max_workers")]
    pub max_workers: i64,
    /// Upper bound on launches per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Launches in flight at once within a cycle.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_spawn_delay")]
    pub spawn_delay: String,
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_program")]
    pub program: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_launcher_program")]
    pub program: String,
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_capacity_program")]
    pub program: String,
    /// Regex matched against session names; matches count as live workers.
    #[serde(default = "default_session_pattern")]
    pub session_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Directory holding the partition's work-item store, relative to the root.
    pub path: Option<String>,
    /// Work-item id prefix owned by this partition (e.g. "gt").
    pub prefix: Option<String>,
}

fn default_max_workers() -> i64 {
    -1
}
fn default_batch_size() -> u32 {
    1
}
fn default_parallelism() -> usize {
    1
}
fn default_spawn_delay() -> String {
    "0s".to_string()
}
fn default_cycle_timeout() -> String {
    "10m".to_string()
}
fn default_heartbeat_interval() -> String {
    "3m".to_string()
}
fn default_store_program() -> String {
    "bd".to_string()
}
fn default_launcher_program() -> String {
    "gt".to_string()
}
fn default_launcher_args() -> Vec<String> {
    vec!["sling".to_string()]
}
fn default_capacity_program() -> String {
    "tmux".to_string()
}
fn default_session_pattern() -> String {
    "-worker-".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            parallelism: default_parallelism(),
            spawn_delay: default_spawn_delay(),
            cycle_timeout: default_cycle_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            program: default_store_program(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_launcher_program(),
            args: default_launcher_args(),
        }
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            program: default_capacity_program(),
            session_pattern: default_session_pattern(),
        }
    }
}

impl SchedulerConfig {
    /// Capacity governance is on only for a positive ceiling.
    pub fn governance_enabled(&self) -> bool {
        self.max_workers > 0
    }

    pub fn spawn_delay(&self) -> Duration {
        parse_duration(&self.spawn_delay).unwrap_or(Duration::ZERO)
    }

    pub fn cycle_timeout(&self) -> Duration {
        parse_duration(&self.cycle_timeout).unwrap_or(Duration::from_secs(600))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.heartbeat_interval).unwrap_or(Duration::from_secs(180))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.parallelism == 0 {
            bail!("scheduler.parallelism must be at least 1");
        }
        for (key, value) in [
            ("scheduler.spawn_delay", &self.spawn_delay),
            ("scheduler.cycle_timeout", &self.cycle_timeout),
            ("scheduler.heartbeat_interval", &self.heartbeat_interval),
        ] {
            if parse_duration(value).is_none() {
                bail!("{key}: invalid duration {value:?}");
            }
        }
        Ok(())
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Load `fleet.toml` from a fleet root directory.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        Self::from_file(&root.join(CONFIG_FILE))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn has_partition(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// The partition that owns an item id by prefix, if any partition claims it.
    pub fn partition_for_item(&self, item_id: &str) -> Option<&str> {
        let prefix = item_prefix(item_id)?;
        self.partitions
            .iter()
            .find(|(_, p)| p.prefix.as_deref() == Some(prefix))
            .map(|(name, _)| name.as_str())
    }

    /// Directories that hold work-item stores: the root, then each partition.
    pub fn store_dirs(&self, root: &Path) -> Vec<PathBuf> {
        let mut dirs = vec![root.to_path_buf()];
        for (name, partition) in &self.partitions {
            let dir = root.join(partition.path.as_deref().unwrap_or(name));
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

/// Walk up from `start` to the first directory containing `fleet.toml`.
pub fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
}

/// The id prefix before the first `-` ("gt-abc" -> "gt").
pub fn item_prefix(item_id: &str) -> Option<&str> {
    let (prefix, rest) = item_id.split_once('-')?;
    if prefix.is_empty() || rest.is_empty() {
        return None;
    }
    Some(prefix)
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.trim().parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours = hours.trim().parse::<u64>().ok()?;
        hours.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
