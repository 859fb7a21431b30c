use crate::config::ConfigView;
use crate::control_loop::{ControlLoop, EVENT_CHANNEL_CAPACITY};
use crate::error::Reporter;
use crate::executor::{DryRunExecutor, PinningExecutor, SchedAffinityExecutor};
use crate::monitor::monitors_from_config;
use crate::policy::PolicyDriver;
use crate::prelude::*;
use crate::topology::NumaTopology;
use crate::watcher::TaskWatcher;
use autopin_shared::Pid;
use autopin_shared::artifacts::ArtifactExt;
use autopin_shared::process_tree::ProcessTree;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Pin the threads of a process to CPUs, driven by NUMA topology and performance counters"
)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "AUTOPIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Set a configuration option, overriding the configuration file.
    /// Can be repeated, e.g. `-o ControlStrategy=scatter -o scatter.interval=500`
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Observe an already running process instead of starting a command
    #[arg(short, long, conflicts_with = "command")]
    pub pid: Option<Pid>,

    /// Interval between two scans of the observed threads
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub poll_interval: Duration,

    /// Folder where the pinning history is saved when the run ends
    #[arg(long, value_name = "DIR")]
    pub history: Option<PathBuf>,

    /// Compute pinnings but do not apply them
    #[arg(long)]
    pub dry_run: bool,

    /// Command to start and observe
    #[arg(trailing_var_arg = true, required_unless_present = "pid")]
    pub command: Vec<String>,
}

fn load_config(cli: &Cli) -> Result<ConfigView> {
    let mut config = match &cli.config {
        Some(path) => ConfigView::load(path)?,
        None => ConfigView::default(),
    };
    config
        .apply_overrides(&cli.options)
        .context("Invalid configuration override")?;
    Ok(config)
}

fn spawn_command(command: &[String]) -> Result<Child> {
    let (program, args) = command
        .split_first()
        .context("No command to observe was given")?;
    let child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to start {program}"))?;
    info!("Started {command:?}");
    Ok(child)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let topology = Arc::new(NumaTopology::discover_or_fallback());
    topology.log_topology();

    let policy = PolicyDriver::from_config(&config, &topology)?;
    let monitors = monitors_from_config(&config)?;
    let executor: Box<dyn PinningExecutor> = if cli.dry_run {
        Box::new(DryRunExecutor)
    } else {
        Box::new(SchedAffinityExecutor)
    };

    let mut child = None;
    let root: Pid = match cli.pid {
        Some(pid) => pid,
        None => {
            let spawned = spawn_command(&cli.command)?;
            let pid = spawned.id().context("The command exited before it could be observed")?;
            child = Some(spawned);
            pid as Pid
        }
    };
    info!("Observing process {root}");

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watcher = tokio::spawn(TaskWatcher::new(root, cli.poll_interval).run(events_tx));

    let mut control = ControlLoop::new(
        ProcessTree::new(root),
        topology,
        policy,
        monitors,
        executor,
        Reporter::default(),
    );
    if cli.history.is_some() {
        control.record_history();
    }

    control.run(events_rx, shutdown_signal()).await;
    let history = control.shutdown();
    watcher.abort();

    if let (Some(folder), Some(history)) = (&cli.history, history) {
        history.save_with_pid_to(folder, root)?;
        info!(
            "Saved {} pinning history entries to {}",
            history.entries.len(),
            folder.display()
        );
    }

    if let Some(fatal) = control.reporter().fatal() {
        if child.is_some() {
            warn!("Leaving process {root} running");
        }
        bail!("Stopped on a fatal error: {fatal}");
    }

    if let Some(mut child) = child {
        let status = child.wait().await?;
        debug!("Process {root} exited with status: {status:?}");
    }
    Ok(())
}
