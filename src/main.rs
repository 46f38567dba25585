use std::path::PathBuf;
use std::process::exit;
use std::{env, fs};

use clap::Parser;

use manager::swarm::SwarmManager;
use metadata::metainfo::Metainfo;

mod bencoding;
mod manager;
mod metadata;
mod persistence;
mod torrent_protocol;
mod tracker;
mod util;
mod web_seed;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[derive(Parser, Debug)]
#[command(version, about = "A single-torrent BitTorrent swarm engine")]
struct Args {
    /// Path to the .torrent file
    metainfo: PathBuf,

    /// Directory the payload is downloaded into
    #[arg(default_value = ".")]
    download_root: PathBuf,

    /// TCP port to listen on for incoming peer connections
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Transfer block size in bytes
    #[arg(long, default_value_t = 16384)]
    block_size: u64,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();

    let contents = match fs::read(&args.metainfo) {
        Ok(contents) => contents,
        Err(e) => {
            log::error!("could not read the .torrent file {:?}: {e}", args.metainfo);
            exit(1);
        }
    };
    let torrent_content = bencoding::Value::new(&contents);
    let metainfo = match Metainfo::new(&torrent_content, &contents) {
        Ok(m) => m,
        Err(e) => {
            log::error!("the .torrent file is invalid: {e}");
            exit(1);
        }
    };
    log::info!("torrent file metainfo:\n{metainfo}");

    // extra peers to bootstrap from, useful on trackerless swarms
    let initial_peers = match env::var("UNDERTOW_INITIAL_PEERS") {
        Ok(peer_list) => peer_list
            .split(',')
            .filter(|addr| !addr.is_empty())
            .map(|addr| addr.trim().to_string())
            .collect(),
        Err(_) => Vec::new(),
    };

    let mut swarm = match SwarmManager::new(
        &metainfo,
        &args.download_root,
        args.port,
        args.block_size,
        initial_peers,
    ) {
        Ok(swarm) => swarm,
        Err(e) => {
            log::error!("could not initialize the swarm engine: {e}");
            exit(1);
        }
    };

    match swarm.start().await {
        Ok(()) => {
            if swarm.payload_complete() {
                log::info!("payload fully verified and persisted, exiting");
            }
            exit(0);
        }
        Err(e) => {
            log::error!("the swarm engine failed: {e}");
            exit(1);
        }
    }
}
