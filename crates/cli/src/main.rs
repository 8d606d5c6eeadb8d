use clap::Parser;
use config::Config;
use orchestrator::{
    FanotifyLibraryWatcher, ProcfsMonitor, RuleSet, Services, SharedLibrarySource, UprobeAttacher,
};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uprobed::{
    cli::Cli,
    dry_run::{DryRunInspector, DryRunProbeManager},
    signals::{SignalEvent, Signals},
};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `UPROBED_LOG` can only refine the level per crate, eg.
    // `UPROBED_LOG=orchestrator=warn uprobed -vvv` logs at the trace level for
    // everything except `orchestrator`.
    let env_filter = EnvFilter::builder()
        .with_env_var("UPROBED_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    // load config
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/uprobed/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/uprobed/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    cli.apply(&mut config.attacher);
    debug!(?config, ?cli);

    let rules = RuleSet::from_config(&config.rules)?;
    if rules.is_empty() {
        warn!("no rules configured, nothing will be attached");
    }

    let libraries: Option<Box<dyn SharedLibrarySource>> = if rules.handles_libraries() {
        let mut watcher = FanotifyLibraryWatcher::new();
        match watcher.init() {
            Ok(()) => Some(Box::new(watcher)),
            Err(err) => {
                warn!(%err, "fanotify unavailable, continuing without library events");
                None
            }
        }
    } else {
        None
    };

    let services = Services {
        probes: Arc::new(DryRunProbeManager::new()),
        inspector: Arc::new(DryRunInspector::new()),
        processes: Arc::new(ProcfsMonitor::from_config(&config.attacher)),
        libraries,
    };
    let attacher = UprobeAttacher::new("uprobed", config.attacher, rules, services, None)?;

    // install signal handlers before the initial scan so an early SIGTERM is
    // not lost
    let mut signals = Signals::install()?;
    attacher.start().await?;

    loop {
        match signals.recv().await {
            SignalEvent::DumpStatus => {
                let status = attacher.status();
                info!(
                    state = %status.state,
                    active_paths = status.registry.active_paths,
                    processes = status.registry.referrers,
                    probes = status.probes,
                    library_events = status.library_events,
                    lost_library_events = status.lost_library_events,
                    syncs = status.syncs,
                    last_sync = ?status.last_sync,
                    exclusions = ?status.exclusions,
                    "current status"
                );
            }
            SignalEvent::Shutdown => {
                info!("shutting down");
                attacher.stop().await?;
                break;
            }
        }
    }

    Ok(())
}
