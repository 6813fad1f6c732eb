//! CommandStore — drives a `bd`-style tracker CLI.
//!
//! Every partition keeps its own store directory; reads fan out over the
//! fleet root plus each partition directory and are de-duplicated by id.
//! Writes run in the directory that owns the item's id prefix.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use fleet_core::config::item_prefix;
use fleet_core::{FleetConfig, WorkItem};

use crate::error::{StoreError, StoreResult};
use crate::store::{LabelQuery, WorkItemStore};

/// Work-item store backed by an external tracker command.
#[derive(Debug, Clone)]
pub struct CommandStore {
    program: String,
    root: PathBuf,
    dirs: Vec<PathBuf>,
    /// Item id prefix -> directory that owns it.
    prefix_dirs: BTreeMap<String, PathBuf>,
}

impl CommandStore {
    pub fn new(program: &str, root: &Path) -> Self {
        Self {
            program: program.to_string(),
            root: root.to_path_buf(),
            dirs: vec![root.to_path_buf()],
            prefix_dirs: BTreeMap::new(),
        }
    }

    /// Build from `fleet.toml`: `[store].program` plus the partition table.
    pub fn from_config(root: &Path, config: &FleetConfig) -> Self {
        let mut prefix_dirs = BTreeMap::new();
        for (name, partition) in &config.partitions {
            if let Some(prefix) = &partition.prefix {
                let dir = root.join(partition.path.as_deref().unwrap_or(name));
                prefix_dirs.insert(prefix.clone(), dir);
            }
        }
        Self {
            program: config.store.program.clone(),
            root: root.to_path_buf(),
            dirs: config.store_dirs(root),
            prefix_dirs,
        }
    }

    /// Directory whose store owns `id`; falls back to the fleet root.
    fn dir_for(&self, id: &str) -> &Path {
        item_prefix(id)
            .and_then(|prefix| self.prefix_dirs.get(prefix))
            .map(PathBuf::as_path)
            .unwrap_or(&self.root)
    }

    async fn run(&self, dir: &Path, args: &[String]) -> StoreResult<Vec<u8>> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(%command, dir = %dir.display(), "running store command");

        let output = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(StoreError::Command {
                command,
                reason: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                },
            });
        }
        Ok(output.stdout)
    }

    async fn query_dir(
        &self,
        dir: &Path,
        label: &str,
        query: LabelQuery,
    ) -> StoreResult<Vec<WorkItem>> {
        let args = match query {
            LabelQuery::Ready => vec![
                "ready".to_string(),
                "--label".to_string(),
                label.to_string(),
                "--json".to_string(),
                "--limit=0".to_string(),
            ],
            LabelQuery::All => vec![
                "list".to_string(),
                format!("--label={label}"),
                "--json".to_string(),
                "--limit=0".to_string(),
            ],
        };
        let out = self.run(dir, &args).await?;
        parse_items(&out)
    }
}

#[async_trait]
impl WorkItemStore for CommandStore {
    async fn get(&self, id: &str) -> StoreResult<Option<WorkItem>> {
        let args = vec!["show".to_string(), id.to_string(), "--json".to_string()];
        let out = match self.run(&self.root, &args).await {
            Ok(out) => out,
            Err(StoreError::Command { reason, .. }) if is_not_found(&reason) => return Ok(None),
            Err(e) => return Err(e),
        };
        // `show --json` returns the item followed by its dependents.
        Ok(parse_items(&out)?.into_iter().next())
    }

    async fn update_labels(&self, id: &str, add: &[&str], remove: &[&str]) -> StoreResult<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        let mut args = vec!["update".to_string(), id.to_string()];
        args.extend(add.iter().map(|l| format!("--add-label={l}")));
        args.extend(remove.iter().map(|l| format!("--remove-label={l}")));
        self.run(self.dir_for(id), &args).await?;
        Ok(())
    }

    async fn update_description(&self, id: &str, text: &str) -> StoreResult<()> {
        let args = vec![
            "update".to_string(),
            id.to_string(),
            format!("--description={text}"),
        ];
        self.run(self.dir_for(id), &args).await?;
        Ok(())
    }

    async fn query_by_label(&self, label: &str, query: LabelQuery) -> StoreResult<Vec<WorkItem>> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut failures = 0;
        let mut last_err = None;

        for dir in &self.dirs {
            match self.query_dir(dir, label, query).await {
                Ok(found) => {
                    for item in found {
                        if seen.insert(item.id.clone()) {
                            items.push(item);
                        }
                    }
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "store query failed");
                    failures += 1;
                    last_err = Some(e);
                }
            }
        }

        if failures == self.dirs.len()
            && let Some(e) = last_err
        {
            return Err(StoreError::Unavailable(format!(
                "all {failures} store directories failed (last: {e})"
            )));
        }
        Ok(items)
    }
}

fn parse_items(out: &[u8]) -> StoreResult<Vec<WorkItem>> {
    if out.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(out).map_err(|e| StoreError::Parse(e.to_string()))
}

fn is_not_found(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.contains("not found") || reason.contains("no issue")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_items_accepts_tracker_json() {
        let out = br#"[{"id":"gt-1","title":"Fix login","status":"open","description":"x","labels":["gt:queued"]},{"id":"gt-2"}]"#;
        let items = parse_items(out).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Fix login");
        assert!(items[0].has_label("gt:queued"));
        assert!(items[1].labels.is_empty());
    }

    #[test]
    fn parse_items_empty_output() {
        assert!(parse_items(b"  \n").unwrap().is_empty());
        assert!(matches!(parse_items(b"oops"), Err(StoreError::Parse(_))));
    }

    #[test]
    fn writes_route_by_prefix() {
        let config = FleetConfig::from_toml(
            "[partitions.alpha]\npath = \"rigs/alpha\"\nprefix = \"al\"\n",
        )
        .unwrap();
        let store = CommandStore::from_config(Path::new("/fleet"), &config);
        assert_eq!(store.dir_for("al-7"), Path::new("/fleet/rigs/alpha"));
        assert_eq!(store.dir_for("hq-7"), Path::new("/fleet"));
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error: issue gt-9 not found"));
        assert!(!is_not_found("database is locked"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn get_and_query_through_script() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-bd");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$1\" in\n  show) echo '[{\"id\":\"gt-1\",\"status\":\"open\"}]' ;;\n  ready) echo '[{\"id\":\"gt-1\"},{\"id\":\"gt-2\"}]' ;;\n  *) echo 'Error: issue not found' >&2; exit 1 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = CommandStore::new(script.to_str().unwrap(), dir.path());
        let item = store.get("gt-1").await.unwrap().unwrap();
        assert_eq!(item.id, "gt-1");

        let ready = store
            .query_by_label("gt:queued", LabelQuery::Ready)
            .await
            .unwrap();
        assert_eq!(ready.len(), 2);

        let err = store.add_label("gt-1", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Command { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CommandStore::new("definitely-not-a-tracker-binary", dir.path());
        let err = store
            .query_by_label("gt:queued", LabelQuery::All)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
