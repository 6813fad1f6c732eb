use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::debug;

use fleet_core::FleetConfig;
use fleet_core::config::{CONFIG_FILE, find_root};
use fleet_scheduler::DispatchEngine;

/// A loaded fleet: its root and an engine wired to the real collaborators.
pub struct Fleet {
    pub root: PathBuf,
    pub engine: DispatchEngine,
}

impl Fleet {
    pub fn open(root: Option<PathBuf>) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("reading current directory")?;
        let root = resolve_root(root, &cwd)?;
        let config = Arc::new(FleetConfig::load(&root)?);
        let engine = DispatchEngine::open(&root, config)
            .with_context(|| format!("wiring dispatch engine for {}", root.display()))?;
        debug!(root = %root.display(), "fleet loaded");
        Ok(Self { root, engine })
    }
}

/// An explicit root must hold `fleet.toml`; otherwise walk up from `cwd`.
pub fn resolve_root(explicit: Option<PathBuf>, cwd: &Path) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(root) => {
            if !root.join(CONFIG_FILE).is_file() {
                bail!("no {CONFIG_FILE} in {}", root.display());
            }
            Ok(root)
        }
        None => find_root(cwd).with_context(|| {
            format!(
                "no {CONFIG_FILE} found in {} or any parent (set --root or FLEET_ROOT)",
                cwd.display()
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_up_to_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "").unwrap();
        let nested = tmp.path().join("alpha/src");
        std::fs::create_dir_all(&nested).unwrap();

        let root = resolve_root(None, &nested).unwrap();
        assert_eq!(root, tmp.path());
    }

    #[test]
    fn explicit_root_needs_config() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_root(Some(tmp.path().to_path_buf()), tmp.path()).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));

        std::fs::write(tmp.path().join(CONFIG_FILE), "").unwrap();
        let root = resolve_root(Some(tmp.path().to_path_buf()), Path::new("/")).unwrap();
        assert_eq!(root, tmp.path());
    }

    #[test]
    fn open_wires_engine_from_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "[scheduler]\nmax_workers = 4\nbatch_size = 2\n\n[partitions.alpha]\nprefix = \"al\"\n",
        )
        .unwrap();

        let fleet = Fleet::open(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(fleet.root, tmp.path());
        assert!(fleet.engine.governance_enabled());
        assert_eq!(fleet.engine.settings().batch_size, 2);
    }
}
