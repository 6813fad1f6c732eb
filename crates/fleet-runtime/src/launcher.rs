//! Worker launch — turns a launch request into a running worker.
//!
//! The launch call returns once the worker has been started; the worker's
//! own lifetime is independent of it.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use fleet_core::config::LauncherConfig;

use crate::error::{LaunchError, LaunchResult};

/// Environment variable that tells the launched process who started it.
pub const CALLER_ENV: &str = "FLEET_CALLER";

/// Caller context stamped on launches made by the dispatch engine.
pub const SCHEDULER_CALLER: &str = "scheduler-dispatch";

/// Everything needed to start one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaunchRequest {
    pub item: String,
    pub partition: String,
    pub formula: Option<String>,
    /// Free-form instructions handed to the worker.
    pub instructions: Option<String>,
    /// Template variables, in order.
    pub vars: Vec<(String, String)>,
    pub merge: Option<String>,
    pub base_branch: Option<String>,
    pub no_merge: bool,
    pub account: Option<String>,
    pub agent: Option<String>,
    /// Attach the raw work item without wrapping it in a template.
    pub hook_raw: bool,
    pub mode: Option<String>,
    /// The launched worker must not defer itself back into the queue.
    pub no_auto_schedule: bool,
    /// Skip group (convoy) creation; the item was grouped at enqueue time.
    pub no_group: bool,
    pub caller_context: Option<String>,
}

impl LaunchRequest {
    pub fn new(item: &str, partition: &str) -> Self {
        Self {
            item: item.to_string(),
            partition: partition.to_string(),
            ..Default::default()
        }
    }

    /// Stamp the flags the dispatch engine always injects.
    pub fn from_scheduler(mut self) -> Self {
        self.no_auto_schedule = true;
        self.no_group = true;
        self.caller_context = Some(SCHEDULER_CALLER.to_string());
        self
    }

    /// Command-line arguments after the launcher's fixed prefix.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.item.clone(), self.partition.clone()];
        let mut opt = |flag: &str, value: &Option<String>| {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                args.push(flag.to_string());
                args.push(v.to_string());
            }
        };
        opt("--formula", &self.formula);
        opt("--args", &self.instructions);
        opt("--merge", &self.merge);
        opt("--base-branch", &self.base_branch);
        opt("--account", &self.account);
        opt("--agent", &self.agent);
        opt("--mode", &self.mode);

        for (key, value) in &self.vars {
            args.push("--var".to_string());
            args.push(format!("{key}={value}"));
        }
        if self.no_merge {
            args.push("--no-merge".to_string());
        }
        if self.hook_raw {
            args.push("--hook-raw-bead".to_string());
        }
        if self.no_auto_schedule {
            args.push("--no-schedule".to_string());
            args.push("--no-boot".to_string());
        }
        if self.no_group {
            args.push("--no-convoy".to_string());
        }
        args
    }
}

/// What a successful launch reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaunchReceipt {
    /// Name of the spawned worker, when the launcher reports one.
    pub worker: Option<String>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> LaunchResult<LaunchReceipt>;
}

/// Launches workers by running an external command.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    prefix: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: &str, prefix: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            prefix,
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        Self::new(&config.program, config.args.clone())
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix)
            .args(request.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(caller) = &request.caller_context {
            cmd.env(CALLER_ENV, caller);
        }
        cmd
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchResult<LaunchReceipt> {
        debug!(
            item = %request.item,
            partition = %request.partition,
            program = %self.program,
            "launching worker"
        );

        let output = self
            .command(request)
            .output()
            .await
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(item = %request.item, status = %output.status, "launch failed");
            return Err(LaunchError::Failed {
                item: request.item.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let worker = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string);
        info!(item = %request.item, partition = %request.partition, ?worker, "worker launched");
        Ok(LaunchReceipt { worker })
    }
}
