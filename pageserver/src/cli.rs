use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pageserver")]
#[command(about = "Page server - serves pages and fans out log prior lists to transaction servers")]
#[command(version)]
pub struct Args {
    #[arg(short, long, default_value = "0.0.0.0:3300")]
    pub listen: SocketAddr,

    #[arg(short, long, default_value = "0.0.0.0:9100")]
    pub metrics: SocketAddr,

    #[arg(long, default_value = "5000")]
    pub handshake_timeout_ms: u64,

    #[arg(long, default_value = "1")]
    pub perm_volume_count: i32,

    #[arg(long, default_value = "4")]
    pub replication_parallel_count: usize,

    #[arg(long, default_value = "64")]
    pub responder_max_in_flight: usize,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub gen_config: Option<PathBuf>,
}
