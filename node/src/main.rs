use anyhow::{Context, Result, bail};
use argh::FromArgs;
use chainlib::db::DbBackend;
use node_lib::{Config, Node, logging};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(FromArgs)]
/// A peer-to-peer chain node
struct Args {
    #[argh(option, default = "PathBuf::from(\".\")")]
    /// directory holding config.toml and the node data
    home: PathBuf,
    #[argh(option)]
    /// node name advertised to peers
    moniker: Option<String>,
    #[argh(option)]
    /// p2p listen address, e.g. tcp://0.0.0.0:46656
    p2p_laddr: Option<String>,
    #[argh(option)]
    /// comma separated seed addresses
    seeds: Option<String>,
    #[argh(option)]
    /// enable or disable the peer exchange reactor
    pex: Option<bool>,
    #[argh(option)]
    /// comma separated RPC listen addresses
    rpc_laddr: Option<String>,
    #[argh(option)]
    /// gRPC listen address
    grpc_laddr: Option<String>,
    #[argh(switch)]
    /// expose administrative RPC routes
    rpc_unsafe: bool,
    #[argh(option)]
    /// core HTTP server address (dashboard and wallet)
    api_addr: Option<String>,
    #[argh(option)]
    /// database backend: memdb or sled
    db_backend: Option<String>,
    #[argh(option)]
    /// fast sync blocks from peers
    fast_sync: Option<bool>,
    #[argh(switch)]
    /// disable wallet indexing
    no_wallet: bool,
    #[argh(option)]
    /// diagnostics server address
    prof_laddr: Option<String>,
    #[argh(option)]
    /// log level filter, overridden by RUST_LOG
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(moniker) = self.moniker {
            config.base.moniker = moniker;
        }
        if let Some(laddr) = self.p2p_laddr {
            config.p2p.laddr = laddr;
        }
        if let Some(seeds) = self.seeds {
            config.p2p.seeds = seeds;
        }
        if let Some(pex) = self.pex {
            config.p2p.pex = pex;
        }
        if let Some(laddr) = self.rpc_laddr {
            config.rpc.laddr = laddr;
        }
        if let Some(laddr) = self.grpc_laddr {
            config.rpc.grpc_laddr = laddr;
        }
        if self.rpc_unsafe {
            config.rpc.unsafe_routes = true;
        }
        if let Some(addr) = self.api_addr {
            config.base.api_addr = addr;
        }
        if let Some(backend) = self.db_backend {
            config.base.db_backend = backend
                .parse::<DbBackend>()
                .with_context(|| format!("invalid --db-backend {backend}"))?;
        }
        if let Some(fast_sync) = self.fast_sync {
            config.base.fast_sync = fast_sync;
        }
        if self.no_wallet {
            config.wallet.enable = false;
        }
        if let Some(laddr) = self.prof_laddr {
            config.base.prof_laddr = laddr;
        }
        if let Some(level) = self.log_level {
            config.process.log_level = level;
        }
        Ok(())
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    if let Some(path) = &config.process.root_ca_certs {
        if !path.is_file() {
            bail!("root CA certificates {} not found", path.display());
        }
    }
    let node = Node::new(config).await.context("failed to create node")?;
    node.start().await.context("failed to start node")?;
    info!(core = %node.core_addr(), rpc = ?node.rpc_addrs(), "node running");
    node.run_forever().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Args = argh::from_env();
    let mut config = match Config::load(&args.home) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = args.apply(&mut config) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }
    // held until exit so buffered log lines are flushed
    let _guard = match logging::init(&config.process) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(Arc::new(config)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
