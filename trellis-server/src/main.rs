//! Trellis Server - replication node for the graph store
//!
//! Subcommands:
//! - serve - Run a node (default)
//! - ping - Check a node's replication endpoint
//! - master - Designate a node master
//! - slaveof - Point a node at its master

mod config;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_core::engine::MemoryEngine;
use trellis_core::replication::{
    AdminClient, ConnectionManager, MasterPolicy, Node, NodeState, TcpConnector,
};

use config::{Config, InitialRole};

/// Trellis Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "trellis-server")]
#[command(about = "Trellis graph store replication node", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, short = 'c', global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a replication node
    Serve {
        /// Replication bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Start as master
        #[arg(long, conflicts_with = "slave_of")]
        master: bool,

        /// Live slaves required before a master accepts writes
        #[arg(long, default_value_t = 0, requires = "master")]
        write_quorum: u32,

        /// Start as slave of HOST:PORT
        #[arg(long)]
        slave_of: Option<String>,
    },
    /// Ping a node
    Ping {
        /// Node address (HOST:PORT)
        addr: String,
    },
    /// Designate a node master
    Master {
        /// Node address (HOST:PORT)
        addr: String,

        /// Live slaves required before writes are accepted
        #[arg(long, default_value_t = 0)]
        write_quorum: u32,
    },
    /// Make a node a slave of another
    #[command(name = "slaveof")]
    SlaveOf {
        /// Node address (HOST:PORT)
        addr: String,
        /// Master host
        host: String,
        /// Master replication port
        port: u16,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("trellis-worker")
        .enable_all()
        .build()?;

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "trellis_server=debug,trellis_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "trellis_server=info,trellis_core=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    rt.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load(&args.config);

    match args.command.unwrap_or(Command::Serve {
        bind: None,
        master: false,
        write_quorum: 0,
        slave_of: None,
    }) {
        Command::Serve {
            bind,
            master,
            write_quorum,
            slave_of,
        } => {
            if let Some(bind) = bind {
                config.replication.bind_addr = bind
                    .parse()
                    .with_context(|| format!("invalid bind address {:?}", bind))?;
            }
            if master {
                config.role.slave_of = None;
                config.role.master = Some(MasterPolicy::new(write_quorum));
            } else if let Some(addr) = slave_of {
                config.role.master = None;
                config.role.slave_of = Some(addr);
            }
            serve(config).await
        }
        Command::Ping { addr } => {
            let mut client = admin_client(&config, &addr).await?;
            let rtt = client.ping().await?;
            println!("pong from {} in {:?}", client.peer(), rtt);
            Ok(())
        }
        Command::Master { addr, write_quorum } => {
            let mut client = admin_client(&config, &addr).await?;
            if !client.make_master(MasterPolicy::new(write_quorum)).await? {
                bail!("{} refused to become master", addr);
            }
            println!("{} is master (write quorum {})", addr, write_quorum);
            Ok(())
        }
        Command::SlaveOf { addr, host, port } => {
            let mut client = admin_client(&config, &addr).await?;
            if !client.slave_of(&host, port).await? {
                bail!("{} refused to follow {}:{}", addr, host, port);
            }
            println!("{} is following {}:{}", addr, host, port);
            Ok(())
        }
    }
}

async fn admin_client(config: &Config, addr: &str) -> anyhow::Result<AdminClient> {
    let connector = TcpConnector::from_config(&config.replication);
    let client = AdminClient::connect(&connector, addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    Ok(client.with_timeout(config.replication.ack_timeout))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let role = config.initial_role()?;
    let connector = Arc::new(TcpConnector::from_config(&config.replication));
    let engine = Arc::new(MemoryEngine::new());
    let node = Node::start(config.replication.clone(), engine, connector)?;

    let manager = ConnectionManager::new(node.clone());
    let listener = manager
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", config.replication.bind_addr))?;
    let listener_task = tokio::spawn(async move { manager.serve(listener).await });

    match role {
        Some(InitialRole::Master(policy)) => {
            node.become_master(policy)?;
            info!("Started as master (write quorum {})", policy.write_quorum);
        }
        Some(InitialRole::SlaveOf { host, port }) => {
            node.become_slave(&host, port).await?;
            info!("Started as slave of {}:{}", host, port);
        }
        None => info!("Awaiting role assignment"),
    }

    let shutdown = node.shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down");
            node.shutdown();
        }
        _ = shutdown.cancelled() => {}
    }

    match tokio::time::timeout(Duration::from_secs(5), listener_task).await {
        Ok(Ok(Err(e))) => error!("Listener failed: {}", e),
        Ok(Err(e)) => error!("Listener task panicked: {}", e),
        Err(_) => warn!("Listener did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    let stats = node.stats();
    info!(
        writes = stats.writes_accepted,
        replicated = stats.replicated_applied,
        syncs = stats.syncs_completed,
        "Node stopped"
    );

    if node.state() == NodeState::Broken {
        bail!("node is broken; restart required");
    }
    Ok(())
}
