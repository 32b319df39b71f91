use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use silo_cli::api::{ApiState, create_control_routes};
use silo_cli::config::{CliConfig, load_or_create_node_id};
use silo_cli::{bind, build_daemon};
use silo_core::config::ConfigUpdate;
use silo_core::daemon::CoreEvent;
use silo_core::election;
use silo_core::join;
use silo_core::node::{NodeDescriptor, NodeRole};
use silo_core::revision::{Action, ActionMsg};
use silo_core::stream::StreamCollector;
use tower_http::cors::{Any, CorsLayer};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Silo object-store control plane.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Proxy,
    Target,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a daemon.
    Start {
        /// Proxy (gateway) or target (storage) role.
        #[arg(long, value_enum, default_value = "proxy")]
        role: Role,
        /// Configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Public port; intra-control and intra-data use port+1/port+2.
        #[arg(short, long)]
        port: Option<u16>,
        /// Advertised hostname.
        #[arg(long)]
        host: Option<String>,
        /// State directory (persisted node id and overrides).
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Primary's control URL to join; omit to found a new cluster.
        #[arg(long)]
        join: Option<String>,
        /// Register as non-electable (proxies only).
        #[arg(long)]
        non_electable: bool,
    },
    /// Print the cluster map.
    Smap(Remote),
    /// Print per-action notification status.
    Status(Remote),
    /// Print the cluster configuration.
    Config(Remote),
    /// Designate a new primary proxy.
    SetPrimary {
        #[command(flatten)]
        remote: Remote,
        /// Proxy id to promote.
        id: String,
    },
    /// Put a node into maintenance (rebalances data off targets first).
    StartMaintenance {
        #[command(flatten)]
        remote: Remote,
        /// Node id.
        id: String,
        /// Skip the rebalance (advanced; may lose data access).
        #[arg(long)]
        skip_rebalance: bool,
    },
    /// Return a node from maintenance.
    StopMaintenance {
        #[command(flatten)]
        remote: Remote,
        /// Node id.
        id: String,
    },
    /// Permanently remove a node after draining it.
    Decommission {
        #[command(flatten)]
        remote: Remote,
        /// Node id.
        id: String,
        #[arg(long)]
        skip_rebalance: bool,
    },
    /// Shut a node down (it may rejoin later).
    ShutdownNode {
        #[command(flatten)]
        remote: Remote,
        /// Node id.
        id: String,
    },
    /// Start a cluster-wide rebalance.
    Rebalance(Remote),
    /// Update the cluster configuration.
    SetConfig {
        #[command(flatten)]
        remote: Remote,
        /// Update as JSON, e.g. '{"rebalance_enabled": false}'.
        json: String,
        /// Apply in-memory only on the receiving daemon.
        #[arg(long)]
        transient: bool,
    },
    /// Forcibly remove a node from the cluster map.
    Remove {
        #[command(flatten)]
        remote: Remote,
        /// Node id.
        id: String,
    },
}

#[derive(Debug, clap::Args)]
struct Remote {
    /// Control URL of any proxy.
    #[arg(long, default_value = "http://127.0.0.1:8081")]
    cluster_url: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level: Level = cli
        .log_level
        .parse()
        .map_err(|_| anyhow!("invalid log level {:?}", cli.log_level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command))
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Start {
            role,
            config,
            port,
            host,
            state_dir,
            join,
            non_electable,
        } => {
            start_daemon(role, config, port, host, state_dir, join, non_electable).await
        }
        Commands::Smap(remote) => show(&remote, "smap").await,
        Commands::Status(remote) => show(&remote, "status").await,
        Commands::Config(remote) => show(&remote, "config").await,
        Commands::SetPrimary { remote, id } => {
            act(&remote, &ActionMsg::named(Action::SetPrimary, id), false).await
        }
        Commands::StartMaintenance {
            remote,
            id,
            skip_rebalance,
        } => {
            let msg = rm_msg(Action::StartMaintenance, &id, skip_rebalance);
            act(&remote, &msg, false).await
        }
        Commands::StopMaintenance { remote, id } => {
            let msg = rm_msg(Action::StopMaintenance, &id, false);
            act(&remote, &msg, false).await
        }
        Commands::Decommission {
            remote,
            id,
            skip_rebalance,
        } => {
            let msg = rm_msg(Action::DecommissionNode, &id, skip_rebalance);
            act(&remote, &msg, false).await
        }
        Commands::ShutdownNode { remote, id } => {
            let msg = rm_msg(Action::ShutdownNode, &id, false);
            act(&remote, &msg, false).await
        }
        Commands::Rebalance(remote) => act(&remote, &ActionMsg::new(Action::Rebalance), false).await,
        Commands::SetConfig {
            remote,
            json,
            transient,
        } => {
            let upd: ConfigUpdate = serde_json::from_str(&json).context("parsing config update")?;
            let msg = ActionMsg {
                action: Action::SetConfig,
                name: None,
                value: Some(serde_json::to_value(&upd)?),
            };
            act(&remote, &msg, transient).await
        }
        Commands::Remove { remote, id } => {
            let client = reqwest::Client::new();
            let url = format!("{}/v1/cluster/daemon/{id}", remote.cluster_url);
            let resp = client.delete(&url).send().await?;
            finish(resp).await
        }
    }
}

fn rm_msg(action: Action, id: &str, skip_rebalance: bool) -> ActionMsg {
    ActionMsg {
        action,
        name: Some(id.to_string()),
        value: Some(json!({ "daemon_id": id, "skip_rebalance": skip_rebalance })),
    }
}

async fn show(remote: &Remote, what: &str) -> Result<()> {
    let url = format!("{}/v1/cluster?what={what}", remote.cluster_url);
    let resp = reqwest::get(&url).await?;
    finish(resp).await
}

async fn act(remote: &Remote, msg: &ActionMsg, transient: bool) -> Result<()> {
    let client = reqwest::Client::new();
    let mut url = format!("{}/v1/cluster", remote.cluster_url);
    if transient {
        url.push_str("?transient=true");
    }
    let resp = client.put(&url).json(msg).send().await?;
    finish(resp).await
}

async fn finish(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !body.is_empty() {
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(_) => println!("{body}"),
        }
    }
    if !status.is_success() {
        bail!("request failed with {status}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn start_daemon(
    role: Role,
    config_path: Option<PathBuf>,
    port: Option<u16>,
    host: Option<String>,
    state_dir: Option<PathBuf>,
    join_url: Option<String>,
    non_electable: bool,
) -> Result<()> {
    let mut config = CliConfig::load(config_path.as_deref())?;
    if let Some(dir) = state_dir {
        config.daemon.state_dir = Some(dir);
    }
    if let Some(port) = port {
        config.daemon.port = port;
    }
    if let Some(host) = host {
        config.daemon.host = host;
    }

    let node_id = load_or_create_node_id(config.daemon.state_dir.as_deref())?;
    let node_role = match role {
        Role::Proxy => NodeRole::Proxy,
        Role::Target => NodeRole::Target,
    };
    let si = NodeDescriptor::new(
        node_id.as_str(),
        node_role,
        &config.daemon.host,
        config.daemon.port,
    );
    info!(
        "starting {si} at {} (public {}, control {})",
        chrono::Utc::now().to_rfc3339(),
        si.public_net,
        si.control_net
    );

    let state = build_daemon(si, config.cluster.clone());
    let core = Arc::clone(&state.core);
    let keepaliver = Arc::clone(&state.keepaliver);

    // The stream collector runs for the daemon's lifetime; the transport
    // layer registers its streams here.
    let _streams = StreamCollector::spawn(20, Duration::from_secs(1), core.shutdown_rx());

    let router = create_control_routes().with_state(state.clone());
    let public = bind(&config.daemon.host, core.si.public_net.port).await?;
    let control = bind(&config.daemon.host, core.si.control_net.port).await?;
    spawn_server(public, router.clone().layer(cors()), &state);
    spawn_server(control, router, &state);

    core.mark_node_started();

    match &join_url {
        Some(url) => {
            join_with_retries(&core, url, non_electable).await?;
            core.mark_cluster_started();
        }
        None => {
            if node_role == NodeRole::Target {
                bail!("targets must join an existing cluster (--join URL)");
            }
            core.bootstrap_primary();
            join::replay_reg_pool(&core).await;
        }
    }

    tokio::spawn(Arc::clone(&keepaliver).run());
    spawn_event_loop(Arc::clone(&core));
    spawn_housekeeping(Arc::clone(&core));

    tokio::signal::ctrl_c().await?;
    info!("interrupt: shutting down {}", core.si);
    keepaliver.send(silo_core::keepalive::KaSignal::Stop).await;
    core.stop();
    // Give the metasyncer its bounded drain.
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

fn cors() -> CorsLayer {
    CorsLayer::new().allow_origin(Any).allow_methods(Any)
}

fn spawn_server(listener: tokio::net::TcpListener, router: axum::Router, state: &ApiState) {
    let mut shutdown = state.core.shutdown_rx();
    tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(err) = serve.await {
            error!("http server exited: {err}");
        }
    });
}

async fn join_with_retries(
    core: &Arc<silo_core::daemon::ControlPlane>,
    url: &str,
    non_electable: bool,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + core.config().timeouts.startup;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match join::self_join(core, url, non_electable, false).await {
            Ok(()) => return Ok(()),
            Err(err) if tokio::time::Instant::now() < deadline => {
                warn!("self-join attempt {attempt} failed: {err}; retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            Err(err) => {
                return Err(anyhow!("failed to join cluster via {url}: {err}"));
            }
        }
    }
}

fn spawn_event_loop(core: Arc<silo_core::daemon::ControlPlane>) {
    let mut events = core.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CoreEvent::PrimaryFailed { primary } => {
                    warn!("primary {primary} reported failed; running fail-over");
                    election::on_primary_fail(&core, &primary).await;
                }
                CoreEvent::TransitionCommitFailed { new_primary } => {
                    // The cluster committed the transition locally; without
                    // the new primary there is no consistent way forward.
                    error!("commit-phase failure on new primary {new_primary}; exiting");
                    core.stop();
                    std::process::exit(1);
                }
            }
        }
    });
}

fn spawn_housekeeping(core: Arc<silo_core::daemon::ControlPlane>) {
    let mut shutdown = core.shutdown_rx();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => core.notifs.housekeep(),
            }
        }
    });
}
