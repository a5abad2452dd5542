use anyhow::{Context, Result};
use clap::Parser;
use rlimit::{getrlimit, setrlimit, Resource};
use std::cmp::min;
use std::fmt;
use std::path::PathBuf;
use std::process::exit;

use client::{Client, Config};
use metadata::metainfo::Metainfo;

mod bencoding;
mod bitfield;
mod client;
mod manager;
mod metadata;
mod persistence;
mod torrent_protocol;
mod tracker;
mod util;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the .torrent file
    #[arg(short, long, env)]
    torrent_file: PathBuf,

    /// Optional base path where pieces and files are downloaded (directory will be created if it does not exist)
    #[arg(short, long, env, default_value = "./yatorrent_downloads")]
    download_dir: PathBuf,

    /// Optional listening port
    #[arg(short, long, env, default_value_t = 8000)]
    port: u16,

    /// Optional log level
    #[arg(short, long, env, default_value_t = LogLevels::Info)]
    log_level: LogLevels,

    /// Keep seeding after the download completes, until interrupted
    #[arg(short, long, env, default_value_t = false)]
    seed: bool,
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

const MAX_OPENED_FILES: u64 = 16384;

fn bump_nofile_limit() -> Result<()> {
    let (soft_limit, hard_limit) =
        getrlimit(Resource::NOFILE).context("could not read current NOFILE ulimit")?;
    if soft_limit < MAX_OPENED_FILES {
        setrlimit(
            Resource::NOFILE,
            min(hard_limit, MAX_OPENED_FILES),
            hard_limit,
        )
        .context("could not increase NOFILE ulimit")?;
    }
    Ok(())
}

async fn run(args: Args, metainfo: Metainfo) -> Result<()> {
    let client = Client::new(Config {
        download_dir: args.download_dir,
        listening_port: args.port,
        peer_id: util::generate_peer_id(),
    })
    .await?;
    let info_hash = client.work_on(metainfo).await?.info_hash();

    let result = tokio::select! {
        r = client.wait_for(info_hash) => r,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, stopping...");
            client.close().await;
            return Ok(());
        }
    };
    match result {
        Ok(path) => log::info!("download completed: {path:?}"),
        Err(e) => {
            client.close().await;
            return Err(e);
        }
    }

    if args.seed {
        log::info!("seeding, press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
    }
    client.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );
    log::info!("yatorrent {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT"));

    if let Err(e) = bump_nofile_limit() {
        log::warn!("{e:#}, many open pieces or connections may fail");
    }

    let contents = match std::fs::read(&args.torrent_file) {
        Ok(c) => c,
        Err(e) => {
            log::error!("could not read .torrent file {:?}: {e}", args.torrent_file);
            exit(1);
        }
    };
    let metainfo = match Metainfo::from_bytes(&contents) {
        Ok(m) => m,
        Err(e) => {
            log::error!("The .torrent file is invalid: could not parse metainfo: {e:#}");
            exit(1);
        }
    };
    log::info!("torrent file metainfo:\n{metainfo}");
    if !metainfo.url_list.is_empty() {
        log::warn!("The .torrent file contains a \"url-list\" field (web seeds), this is not supported by this client");
    }

    if let Err(e) = run(args, metainfo).await {
        log::error!("{e:#}");
        exit(1);
    }
    Ok(())
}
