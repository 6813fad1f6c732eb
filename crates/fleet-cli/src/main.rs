use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod context;

use commands::schedule::LaunchParams;

#[derive(Parser)]
#[command(
    name = "fleet",
    about = "Fleet — capacity-governed work dispatch",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Fleet root (the directory holding fleet.toml). Found by walking up
    /// from the current directory when not given.
    #[arg(long, global = true, env = "FLEET_ROOT")]
    root: Option<PathBuf>,

    /// Name recorded in pause state and the event feed.
    #[arg(long, global = true, env = "FLEET_ACTOR", default_value = "operator")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deferred, capacity-governed dispatch of work items
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Queue a work item for dispatch into a partition.
    ///
    /// With governance off (max_workers <= 0) a dispatch cycle runs
    /// immediately after queueing.
    Add {
        /// Work item id
        item: String,
        /// Target partition
        partition: String,
        #[command(flatten)]
        params: LaunchParams,
        /// Skip the ownership, status, and already-queued checks
        #[arg(long)]
        force: bool,
        /// Validate only, write nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue many work items into one partition
    Batch {
        partition: String,
        #[arg(required = true)]
        items: Vec<String>,
        #[command(flatten)]
        params: LaunchParams,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one dispatch cycle
    Run {
        /// Show the plan without launching anything
        #[arg(long)]
        dry_run: bool,
        /// Override scheduler.max_workers for this cycle
        #[arg(long)]
        max: Option<i64>,
        /// Override scheduler.batch_size for this cycle
        #[arg(long)]
        batch: Option<u32>,
    },
    /// Show pause state, capacity, and queue depth
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List queued and quarantined items by partition
    List {
        #[arg(long)]
        json: bool,
    },
    /// Stop dispatch cycles from launching anything
    Pause,
    /// Let dispatch cycles launch again
    Resume,
    /// Take items out of the queue (metadata is left in place)
    Clear {
        /// Only this item
        #[arg(long)]
        item: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleet=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let fleet = context::Fleet::open(cli.root)?;
    let actor = cli.actor.as_str();

    match cli.command {
        Commands::Schedule { action } => match action {
            ScheduleAction::Add {
                item,
                partition,
                params,
                force,
                dry_run,
            } => {
                commands::schedule::add(&fleet, actor, &item, &partition, params, force, dry_run)
                    .await
            }
            ScheduleAction::Batch {
                partition,
                items,
                params,
                force,
                dry_run,
            } => {
                commands::schedule::batch(&fleet, actor, &partition, &items, params, force, dry_run)
                    .await
            }
            ScheduleAction::Run { dry_run, max, batch } => {
                commands::schedule::run(&fleet, actor, dry_run, max, batch).await
            }
            ScheduleAction::Status { json } => commands::schedule::status(&fleet, json).await,
            ScheduleAction::List { json } => commands::schedule::list(&fleet, json).await,
            ScheduleAction::Pause => commands::schedule::pause(&fleet, actor),
            ScheduleAction::Resume => commands::schedule::resume(&fleet),
            ScheduleAction::Clear { item } => {
                commands::schedule::clear(&fleet, item.as_deref()).await
            }
        },
    }
}
