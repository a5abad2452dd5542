use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::manager::peer::WRITE_TIMEOUT;
use crate::manager::torrent_manager::TorrentManager;
use crate::metadata::metainfo::Metainfo;
use crate::torrent_protocol::wire_protocol::ProtocolReadHalf;
use crate::tracker::{Event, OkResponse, Stats, TrackerClient};
use crate::util::pretty_info_hash;

const TRACKER_RETRY: Duration = Duration::from_secs(10);

/// Settings shared by every torrent of a client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pieces and assembled files of each torrent go under `<download_dir>/<hex info hash>`.
    pub download_dir: PathBuf,
    pub listening_port: u16,
    pub peer_id: [u8; 20],
}

/// Downloads and seeds any number of torrents, accepting inbound connections on one port.
pub struct Client {
    config: Config,
    torrents: Arc<DashMap<[u8; 20], Arc<TorrentManager>>>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl Client {
    /// Binds the listening port and starts accepting connections. With port 0 a free port is
    /// picked and recorded in the configuration.
    pub async fn new(mut config: Config) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.listening_port))
            .await
            .with_context(|| format!("could not listen on port {}", config.listening_port))?;
        config.listening_port = listener.local_addr()?.port();
        log::info!("listening for peers on port {}", config.listening_port);

        let client = Client {
            config,
            torrents: Arc::new(DashMap::new()),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        client.tasks.spawn(accept_connections(
            listener,
            client.torrents.clone(),
            client.stop.clone(),
            client.tasks.clone(),
        ));
        Ok(client)
    }

    #[cfg(test)]
    pub fn listening_port(&self) -> u16 {
        self.config.listening_port
    }

    /// Starts downloading and seeding a torrent and announcing it to its trackers.
    pub async fn work_on(&self, metainfo: Metainfo) -> Result<Arc<TorrentManager>> {
        let info_hash = metainfo.info_hash;
        if self.torrents.contains_key(&info_hash) {
            bail!("already working on torrent {}", pretty_info_hash(info_hash));
        }
        let tiers = if metainfo.announce_list.is_empty() {
            vec![vec![metainfo.announce.clone()]]
        } else {
            metainfo.announce_list.clone()
        };
        let tracker = TrackerClient::new(self.config.peer_id, tiers, self.config.listening_port)?;
        let tm = TorrentManager::new(metainfo, &self.config, &self.stop).await?;
        self.torrents.insert(info_hash, tm.clone());
        tm.start();
        self.tasks.spawn(announce(tm.clone(), tracker));
        Ok(tm)
    }

    /// Waits for a torrent to complete and assembles its files. Returns the path of the single
    /// file or of the top directory.
    pub async fn wait_for(&self, info_hash: [u8; 20]) -> Result<PathBuf> {
        let tm = self
            .torrents
            .get(&info_hash)
            .map(|t| t.value().clone())
            .ok_or_else(|| anyhow!("unknown torrent {}", pretty_info_hash(info_hash)))?;
        tm.wait_until_downloaded().await?;
        tm.assemble()
            .await
            .with_context(|| format!("failed to reconstruct torrent {}", tm.metainfo.name()))
    }

    /// Stops downloading and seeding a torrent.
    pub async fn cancel(&self, info_hash: [u8; 20]) -> Result<()> {
        let Some((_, tm)) = self.torrents.remove(&info_hash) else {
            bail!("unknown torrent {}", pretty_info_hash(info_hash));
        };
        tm.cancel_download().await;
        Ok(())
    }

    /// Stops every torrent and waits for all tasks to end.
    pub async fn close(&self) {
        self.stop.cancel();
        let torrents: Vec<Arc<TorrentManager>> =
            self.torrents.iter().map(|t| t.value().clone()).collect();
        for tm in torrents {
            tm.close().await;
        }
        self.tasks.close();
        self.tasks.wait().await;
        log::info!("client stopped");
    }
}

async fn accept_connections(
    listener: TcpListener,
    torrents: Arc<DashMap<[u8; 20], Arc<TorrentManager>>>,
    stop: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("error accepting connection: {e}");
                    continue;
                }
            },
        };
        log::trace!("new connection from {addr}");
        let torrents = torrents.clone();
        tasks.spawn(async move {
            if let Err(e) = route_connection(stream, &torrents).await {
                log::debug!("dropping connection from {addr}: {e:#}");
            }
        });
    }
}

/// Reads the handshake of an inbound connection and hands it to the torrent it asks for.
async fn route_connection(
    mut stream: TcpStream,
    torrents: &DashMap<[u8; 20], Arc<TorrentManager>>,
) -> Result<()> {
    let theirs = timeout(WRITE_TIMEOUT, stream.receive_handshake())
        .await
        .context("timed out waiting for handshake")??;
    let tm = torrents
        .get(&theirs.info_hash)
        .map(|t| t.value().clone())
        .ok_or_else(|| anyhow!("unknown info hash {}", pretty_info_hash(theirs.info_hash)))?;
    tm.add_leecher(stream, &theirs).await
}

fn stats(tm: &TorrentManager) -> Stats {
    Stats {
        uploaded: tm.uploaded(),
        downloaded: tm.downloaded(),
        left: tm.left(),
    }
}

/// Announce cycle of one torrent.
///
/// The started announce is retried until a tracker answers; an answer without an interval
/// cancels the torrent. Then the trackers are announced to at every interval, once on completion,
/// and a last time when the torrent stops.
async fn announce(tm: Arc<TorrentManager>, mut tracker: TrackerClient) {
    let info_hash = tm.info_hash();
    let name = tm.metainfo.name().to_string();
    let response = loop {
        match tracker.request(info_hash, stats(&tm), Event::Started).await {
            Ok(response) => break response,
            Err(e) => log::warn!(
                "{name}: announce failed, retrying in {}s: {e:#}",
                TRACKER_RETRY.as_secs()
            ),
        }
        tokio::select! {
            _ = tm.stop.cancelled() => return,
            _ = tm.cancel.cancelled() => return,
            _ = sleep(TRACKER_RETRY) => {}
        }
    };
    let Some(mut interval_secs) = response.interval else {
        log::error!("{name}: tracker did not provide an announce interval, cancelling torrent");
        tm.cancel_download().await;
        return;
    };
    add_peers(&tm, &response);

    let period = |secs: u64| Duration::from_secs(secs.max(1));
    let mut ticker = interval_at(Instant::now() + period(interval_secs), period(interval_secs));
    // already complete from disk: the tracker never saw this client downloading
    let mut completed_announced = tm.left() == 0;
    loop {
        let event = tokio::select! {
            _ = tm.stop.cancelled() => Event::Stopped,
            _ = tm.cancel.cancelled() => Event::Stopped,
            _ = tm.completed.cancelled(), if !completed_announced => Event::Completed,
            _ = ticker.tick() => Event::None,
        };
        if event == Event::Completed {
            completed_announced = true;
        }
        match tracker.request(info_hash, stats(&tm), event).await {
            Ok(response) if event != Event::Stopped => {
                add_peers(&tm, &response);
                if let Some(secs) = response.interval.filter(|s| *s != interval_secs) {
                    log::debug!("{name}: announce interval changed to {secs}s");
                    interval_secs = secs;
                    ticker = interval_at(Instant::now() + period(secs), period(secs));
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("{name}: announce ({event}) failed: {e:#}"),
        }
        if event == Event::Stopped {
            break;
        }
    }
    log::debug!("{name}: announce cycle ended");
}

fn add_peers(tm: &Arc<TorrentManager>, response: &OkResponse) {
    log::debug!(
        "{}: tracker returned {} peers ({:?} seeders, {:?} leechers)",
        tm.metainfo.name(),
        response.peers.len(),
        response.complete,
        response.incomplete
    );
    tm.update_seeders(response.peers.iter().map(|p| p.addr()));
}
