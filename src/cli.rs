use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "spiderq")]
#[command(about = "Distributed page downloader over a durable task queue", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $SPIDERQ_CONFIG, then config/spiderq.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the queue broker
    Broker(BrokerArgs),
    /// Discover partitions and publish one task per URL
    Master(MasterArgs),
    /// Consume tasks and download pages until interrupted
    Worker,
}

#[derive(clap::Args, Debug)]
pub struct BrokerArgs {
    /// Address to bind the broker to (overrides broker.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct MasterArgs {
    /// Read partitions from this TOML/JSON file instead of the configured source
    #[arg(long)]
    pub partitions: Option<PathBuf>,
}
