use std::path::PathBuf;
use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use minnow::{Config, MetaInfo, StrategyKind, Torrent};

#[derive(Parser)]
#[command(name = "minnow", version, about = "A leech-only BitTorrent client")]
struct Args {
    #[arg(help = "Path to the .torrent file")]
    torrent: PathBuf,

    #[arg(short, long, default_value = "downloads", help = "Output directory")]
    output: PathBuf,

    #[arg(short, long, default_value_t = 6881, help = "Port reported to the tracker")]
    port: u16,

    #[arg(
        short,
        long,
        default_value = "smart",
        value_parser = parse_strategy,
        help = "Piece selection: sequential, random, rarest-first or smart"
    )]
    strategy: StrategyKind,

    #[arg(long, default_value_t = 50, help = "Maximum peer connections")]
    max_peers: usize,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,
}

fn parse_strategy(s: &str) -> Result<StrategyKind, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .init();

    let metainfo = MetaInfo::open(&args.torrent)?;
    tracing::info!(
        "loaded {:?}: {} pieces of {} bytes, info hash {}",
        metainfo.name(),
        metainfo.num_pieces(),
        metainfo.piece_len(),
        metainfo.info_hash_hex(),
    );

    let config = Config {
        output_dir: args.output,
        port: args.port,
        strategy: args.strategy,
        max_peers: args.max_peers,
        ..Config::default()
    };

    let mut torrent = Torrent::new(metainfo, config)?;

    let cancel = torrent.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupted, shutting down");
        cancel.cancel();
    });

    torrent.run().await?;
    Ok(())
}
