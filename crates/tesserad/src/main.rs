//! `tesserad` — the Tessera storage target daemon.
//!
//! # Usage
//!
//! ```text
//! tesserad start -c tessera.toml            # start the target
//! tesserad start -c tessera.toml --rebalance  # force a rebalance at startup
//! tesserad resilver -c tessera.toml         # one-shot local resilver
//! tesserad status 10.0.0.1:7811             # query a target's rebalance status
//! ```

mod config;
mod handler;
mod telemetry;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tessera_cluster::{Smap, SmapOwner, TargetNode};
use tessera_fs::{marker_present, note_node_restart, Marker, Mountpath, NoopFsHealth};
use tessera_net::{serve, CtrlClient, CtrlRequest, CtrlResponse};
use tessera_reb::{RebManager, RebManagerArgs};
use tessera_types::TargetId;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use config::DaemonConfig;
use handler::{NodeInbound, NodePeerClient, NodeTransport};

#[derive(Parser)]
#[command(name = "tesserad", about = "Tessera storage target daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the storage target.
    Start {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Run a cluster rebalance once the node is up.
        #[arg(long)]
        rebalance: bool,
    },
    /// Run a one-shot local resilver and exit.
    Resilver {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Query a target's rebalance status.
    Status {
        /// Control address of the target.
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { config, rebalance } => start(&config, rebalance).await,
        Command::Resilver { config } => resilver(&config).await,
        Command::Status { addr } => status(addr).await,
    }
}

fn build_smap(cfg: &DaemonConfig) -> Smap {
    let mut targets = BTreeMap::new();
    for t in &cfg.cluster.targets {
        let id = TargetId::new(&t.id);
        targets.insert(
            id.clone(),
            TargetNode {
                id,
                data_addr: t.data_addr,
                ctrl_addr: t.ctrl_addr,
            },
        );
    }
    Smap {
        version: cfg.cluster.smap_version,
        targets,
    }
}

async fn start(config_path: &std::path::Path, force_rebalance: bool) -> Result<()> {
    let cfg = DaemonConfig::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    telemetry::init(&cfg.log.level);

    let local = TargetId::new(&cfg.node.id);
    let mpaths: Vec<Mountpath> = cfg.node.mountpaths.iter().map(Mountpath::new).collect();
    let reb_config = cfg.reb_config();
    let smap_owner = SmapOwner::new(build_smap(&cfg));

    let restarted = note_node_restart(&cfg.node.conf_dir).await?;
    if restarted {
        info!(target_id = %local, "node restart detected");
    }

    let transport = Arc::new(NodeTransport::new(
        smap_owner.clone(),
        reb_config.timeout.stream_connect,
    ));
    let client = Arc::new(NodePeerClient::new(
        smap_owner.clone(),
        reb_config.timeout.cplane_op,
    ));

    let mgr = RebManager::new(RebManagerArgs {
        local: local.clone(),
        mpaths,
        conf_dir: cfg.node.conf_dir.clone(),
        smap_owner: smap_owner.clone(),
        transport,
        client,
        health: Arc::new(NoopFsHealth),
        config: reb_config,
    });

    // Both listeners feed the same inbound dispatcher: connections
    // announce their bundle with a tag byte.
    let inbound = NodeInbound::new(mgr.clone());
    let data_listener = TcpListener::bind(cfg.node.data_listen)
        .await
        .with_context(|| format!("binding data listener on {}", cfg.node.data_listen))?;
    let ctrl_listener = TcpListener::bind(cfg.node.ctrl_listen)
        .await
        .with_context(|| format!("binding control listener on {}", cfg.node.ctrl_listen))?;
    tokio::spawn(serve(data_listener, inbound.clone()));
    tokio::spawn(serve(ctrl_listener, inbound));

    info!(
        target_id = %local,
        data = %cfg.node.data_listen,
        ctrl = %cfg.node.ctrl_listen,
        targets = cfg.cluster.targets.len(),
        "target is up"
    );

    // An interrupted resilver resumes first: fragments must sit on their
    // HRW mountpaths before cluster-wide placement decisions are made.
    if marker_present(&cfg.node.conf_dir, Marker::Resilver).await {
        warn!(target_id = %local, "unfinished resilver detected, resuming");
        if let Err(e) = mgr.run_resilver().await {
            error!(error = %e, "resilver failed");
        }
    }

    let interrupted = marker_present(&cfg.node.conf_dir, Marker::Rebalance).await;
    if interrupted {
        warn!(target_id = %local, "unfinished rebalance detected, resuming");
    }
    if force_rebalance || interrupted {
        let mgr = mgr.clone();
        let buckets = cfg.ec_buckets();
        tokio::spawn(async move {
            if let Err(e) = mgr.run_rebalance(&buckets).await {
                error!(error = %e, "rebalance failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!(target_id = %local, "shutting down");
    Ok(())
}

async fn resilver(config_path: &std::path::Path) -> Result<()> {
    let cfg = DaemonConfig::load(config_path)?;
    telemetry::init(&cfg.log.level);

    let local = TargetId::new(&cfg.node.id);
    let mpaths: Vec<Mountpath> = cfg.node.mountpaths.iter().map(Mountpath::new).collect();
    let reb_config = cfg.reb_config();
    let smap_owner = SmapOwner::new(build_smap(&cfg));

    let transport = Arc::new(NodeTransport::new(
        smap_owner.clone(),
        reb_config.timeout.stream_connect,
    ));
    let client = Arc::new(NodePeerClient::new(
        smap_owner.clone(),
        reb_config.timeout.cplane_op,
    ));
    let mgr = RebManager::new(RebManagerArgs {
        local,
        mpaths,
        conf_dir: cfg.node.conf_dir.clone(),
        smap_owner,
        transport,
        client,
        health: Arc::new(NoopFsHealth),
        config: reb_config,
    });

    mgr.run_resilver().await?;
    Ok(())
}

async fn status(addr: SocketAddr) -> Result<()> {
    let client = CtrlClient::new(std::time::Duration::from_secs(5));
    match client.request(addr, &CtrlRequest::RebStatus).await? {
        CtrlResponse::RebStatus(st) => {
            println!("{}", serde_json::to_string_pretty(&st)?);
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}
