//! Command-line entry point: take metainfo paths, download them all.
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use riptide::client::Client;
use riptide::config::Config;
use riptide::metainfo::Metainfo;

#[derive(Debug, Parser)]
#[command(name = "riptide", about = "A leech-capable BitTorrent client", version)]
struct Args {
    /// Metainfo (.torrent) files to download.
    #[arg(required = true)]
    torrents: Vec<PathBuf>,

    /// TCP port to listen on and report to trackers.
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Directory to place downloads under.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config {
        port: args.port,
        download_root: args.output_dir,
        ..Config::default()
    };

    let mut client = Client::new(config);
    for path in &args.torrents {
        let metainfo = Metainfo::from_file(path)
            .with_context(|| format!("parsing {}", path.display()))?;
        client.add_torrent(metainfo)?;
    }

    client.download_all().await
}
