use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockfs::cluster::PlacementPolicy;
use blockfs::{cli, Controller, ControllerConfig, NodeConfig, Phase, StorageNode};

fn main() -> anyhow::Result<()> {
    let matches = command().get_matches();

    init_logging(matches.get_one::<String>("log-level"));

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(matches));

    // The operator menu may be parked in a stdin read that cannot be cancelled.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("controller", args)) => run_controller(controller_config(args)?).await,
        Some(("node", args)) => run_node(node_config(args)?).await,
        _ => unreachable!("subcommand is required"),
    }
}

fn command() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .value_name("FILE")
        .help("JSON configuration file; flags override its values");

    Command::new("blockfs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Minimal distributed block storage: a controller and storage nodes")
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .help("Log filter, e.g. info or blockfs=debug (defaults to RUST_LOG, then info)"),
        )
        .subcommand(
            Command::new("controller")
                .about("Run the controller")
                .arg(config_arg.clone())
                .arg(Arg::new("listen").long("listen").help("Control endpoint address"))
                .arg(
                    Arg::new("quorum")
                        .long("quorum")
                        .value_parser(clap::value_parser!(usize))
                        .help("Storage nodes required before uploads are accepted"),
                )
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .value_parser(clap::value_parser!(usize))
                        .help("Block size in bytes"),
                )
                .arg(
                    Arg::new("replication-factor")
                        .long("replication-factor")
                        .value_parser(clap::value_parser!(u32))
                        .help("Extra copies per block"),
                )
                .arg(
                    Arg::new("placement")
                        .long("placement")
                        .help("round-robin, round-robin-coupled, least-loaded or random"),
                )
                .arg(Arg::new("metadata").long("metadata").help("Metadata file path"))
                .arg(
                    Arg::new("download-dir")
                        .long("download-dir")
                        .help("Directory downloads are written to"),
                )
                .arg(
                    Arg::new("heartbeat-ms")
                        .long("heartbeat-ms")
                        .value_parser(clap::value_parser!(u64))
                        .help("Heartbeat interval used by the failure detector"),
                )
                .arg(
                    Arg::new("http")
                        .long("http")
                        .value_name("ADDR")
                        .help("Serve the HTTP operator API on this address"),
                )
                .arg(
                    Arg::new("re-replicate")
                        .long("re-replicate")
                        .action(ArgAction::SetTrue)
                        .help("Re-create block copies held by dead nodes"),
                )
                .arg(
                    Arg::new("no-purge")
                        .long("no-purge")
                        .action(ArgAction::SetTrue)
                        .help("Keep blocks and metadata on exit"),
                )
                .arg(
                    Arg::new("no-interactive")
                        .long("no-interactive")
                        .action(ArgAction::SetTrue)
                        .help("Do not start the operator menu on stdin"),
                ),
        )
        .subcommand(
            Command::new("node")
                .about("Run a storage node")
                .arg(config_arg)
                .arg(Arg::new("listen").long("listen").help("Block endpoint address"))
                .arg(
                    Arg::new("controller")
                        .long("controller")
                        .help("Controller address"),
                )
                .arg(
                    Arg::new("data-dir")
                        .long("data-dir")
                        .help("Directory blocks are stored in"),
                )
                .arg(
                    Arg::new("heartbeat-ms")
                        .long("heartbeat-ms")
                        .value_parser(clap::value_parser!(u64))
                        .help("Interval between heartbeats to the controller"),
                ),
        )
}

fn init_logging(level: Option<&String>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn controller_config(args: &ArgMatches) -> anyhow::Result<ControllerConfig> {
    let mut config = match args.get_one::<String>("config") {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };

    if let Some(listen) = args.get_one::<String>("listen") {
        config.listen_addr = listen.clone();
    }
    if let Some(quorum) = args.get_one::<usize>("quorum") {
        config.quorum = *quorum;
    }
    if let Some(chunk_size) = args.get_one::<usize>("chunk-size") {
        config.chunk_size = *chunk_size;
    }
    if let Some(factor) = args.get_one::<u32>("replication-factor") {
        config.replication_factor = *factor;
    }
    if let Some(placement) = args.get_one::<String>("placement") {
        config.placement = placement
            .parse::<PlacementPolicy>()
            .with_context(|| format!("invalid --placement {}", placement))?;
    }
    if let Some(path) = args.get_one::<String>("metadata") {
        config.metadata_path = PathBuf::from(path);
    }
    if let Some(dir) = args.get_one::<String>("download-dir") {
        config.download_dir = PathBuf::from(dir);
    }
    if let Some(ms) = args.get_one::<u64>("heartbeat-ms") {
        config.heartbeat_interval_ms = *ms;
    }
    if let Some(addr) = args.get_one::<String>("http") {
        let mut http = config.http.take().unwrap_or_default();
        http.listen_addr = addr.clone();
        config.http = Some(http);
    }
    if args.get_flag("re-replicate") {
        config.re_replicate = true;
    }
    if args.get_flag("no-purge") {
        config.purge_on_exit = false;
    }
    if args.get_flag("no-interactive") {
        config.interactive = false;
    }

    config.validate()?;
    Ok(config)
}

fn node_config(args: &ArgMatches) -> anyhow::Result<NodeConfig> {
    let mut config = match args.get_one::<String>("config") {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    if let Some(listen) = args.get_one::<String>("listen") {
        config.listen_addr = listen.clone();
    }
    if let Some(controller) = args.get_one::<String>("controller") {
        config.controller_addr = controller.clone();
    }
    if let Some(dir) = args.get_one::<String>("data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(ms) = args.get_one::<u64>("heartbeat-ms") {
        config.heartbeat_interval_ms = *ms;
    }

    config.validate()?;
    Ok(config)
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    info!("Starting blockfs controller on {}", config.listen_addr);

    let mut dirs = vec![config.download_dir.clone()];
    if let Some(parent) = config.metadata_path.parent() {
        if !parent.as_os_str().is_empty() {
            dirs.push(parent.to_path_buf());
        }
    }
    system::environment_check(&dirs)?;

    let controller = Controller::new(config.clone()).await?;
    let server = network::Server::bind(&config.listen_addr, config.network.clone()).await?;
    let mut serve_task = tokio::spawn(controller.clone().serve(server));

    let http_task = config.http.clone().map(|http| {
        let service: Arc<dyn api::FileService> = controller.clone();
        let mut phase = controller.subscribe_phase();
        tokio::spawn(async move {
            let stopped = async move {
                let _ = phase.wait_for(|p| *p == Phase::ShuttingDown).await;
            };
            api::Server::new(http, service).start(stopped).await
        })
    });

    let menu_task = config
        .interactive
        .then(|| tokio::spawn(cli::run_menu(controller.clone())));

    let finished = tokio::select! {
        result = &mut serve_task => Some(result),
        _ = system::shutdown_signal() => None,
    };

    match finished {
        Some(result) => result??,
        None => {
            controller.shutdown(config.purge_on_exit).await?;
            serve_task.await??;
        }
    }

    controller.wait_idle().await;

    if let Some(task) = menu_task {
        task.abort();
    }
    if let Some(task) = http_task {
        task.await??;
    }

    info!("Controller stopped");
    Ok(())
}

async fn run_node(config: NodeConfig) -> anyhow::Result<()> {
    info!(
        "Starting blockfs storage node on {} (controller {})",
        config.listen_addr, config.controller_addr
    );

    system::environment_check(&[&config.data_dir])?;

    let (node, server) = StorageNode::bind(config).await?;
    let mut run_task = tokio::spawn(node.clone().run(server));

    tokio::select! {
        result = &mut run_task => {
            result??;
        }
        _ = system::shutdown_signal() => {
            node.terminate();
            run_task.await??;
        }
    }

    info!("Storage node stopped");
    Ok(())
}
