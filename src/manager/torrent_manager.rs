use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::{DashMap, DashSet};
use size::Size;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bitfield::Bitfield;
use crate::client::Config;
use crate::manager::peer::{Peer, PeerAddr};
use crate::manager::piece_requestor::{
    keep_alive_seeder, request_pieces, sample_rates, PieceInProgress, DOWNLOAD_SLOTS,
};
use crate::manager::piece_uploader::{
    handle_requests, keep_alive_leecher, serve_uploads, PendingUpload, UPLOAD_SLOTS,
};
use crate::manager::slots::Slots;
use crate::metadata::metainfo::Metainfo;
use crate::persistence::file_manager::FileManager;
use crate::torrent_protocol::wire_protocol::Handshake;
use crate::util::pretty_info_hash;

/// Coordinator of one torrent: owns its pieces, its peers and every task working on it.
///
/// Tasks observe three signals. `stop` is a child of the client shutdown token, `cancel` aborts
/// the download, `completed` fires once every piece is verified. Uploads have their own
/// `cancel_upload` signal, so a completed torrent keeps seeding until cancelled or stopped.
pub struct TorrentManager {
    pub metainfo: Metainfo,
    pub(crate) own_peer_id: [u8; 20],
    pub bitfield: Bitfield,
    pub(crate) file_manager: FileManager,
    pub(crate) uploaded: AtomicU64,
    pub(crate) downloaded: AtomicU64,
    pub(crate) seeders: DashMap<PeerAddr, Arc<Peer>>,
    pub(crate) leechers: DashMap<PeerAddr, Arc<Peer>>,
    known_seeders: DashSet<PeerAddr>,
    pub(crate) download_slots: Slots<PieceInProgress>,
    pub(crate) upload_slots: Slots<PendingUpload>,
    pub(crate) stop: CancellationToken,
    pub(crate) cancel: CancellationToken,
    pub(crate) cancel_upload: CancellationToken,
    pub(crate) completed: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl fmt::Display for TorrentManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}/{} pieces, downloaded {}, uploaded {}, {} seeders, {} leechers",
            self.metainfo.name(),
            pretty_info_hash(self.metainfo.info_hash),
            self.bitfield.count_set(),
            self.metainfo.piece_count(),
            Size::from_bytes(self.downloaded()),
            Size::from_bytes(self.uploaded()),
            self.seeders.len(),
            self.leechers.len()
        )
    }
}

impl TorrentManager {
    /// Creates the coordinator and checks which pieces are already on disk.
    pub async fn new(
        metainfo: Metainfo,
        config: &Config,
        client_stop: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let file_manager = FileManager::new(&config.download_dir, &metainfo);
        let bitfield = Bitfield::new(metainfo.piece_count());
        let verified = file_manager.verify_existing(&bitfield).await;
        Ok(Arc::new(TorrentManager {
            own_peer_id: config.peer_id,
            bitfield,
            file_manager,
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(verified),
            seeders: DashMap::new(),
            leechers: DashMap::new(),
            known_seeders: DashSet::new(),
            download_slots: Slots::new(DOWNLOAD_SLOTS),
            upload_slots: Slots::new(UPLOAD_SLOTS),
            stop: client_stop.child_token(),
            cancel: CancellationToken::new(),
            cancel_upload: CancellationToken::new(),
            completed: CancellationToken::new(),
            tasks: TaskTracker::new(),
            metainfo,
        }))
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Bytes of the pieces not verified yet.
    pub fn left(&self) -> u64 {
        self.bitfield
            .missing_pieces()
            .into_iter()
            .map(|idx| self.metainfo.piece_size(idx))
            .sum()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }

    /// Spawns the scheduler, the upload server and the rate sampler.
    pub fn start(self: &Arc<Self>) {
        log::info!("starting torrent {self}");
        self.tasks.spawn(request_pieces(self.clone()));
        self.tasks.spawn(serve_uploads(self.clone()));
        self.tasks.spawn(sample_rates(self.clone()));
    }

    /// Starts keeping alive every address not seen before.
    pub fn update_seeders(self: &Arc<Self>, addrs: impl IntoIterator<Item = PeerAddr>) {
        if self.stop.is_cancelled() || self.cancel.is_cancelled() || self.is_completed() {
            return;
        }
        for addr in addrs {
            if self.known_seeders.insert(addr.clone()) {
                log::debug!("new peer {addr} for {}", self.metainfo.name());
                self.tasks.spawn(keep_alive_seeder(self.clone(), addr));
            }
        }
    }

    /// Takes over an inbound connection whose handshake was already read.
    pub async fn add_leecher(self: &Arc<Self>, stream: TcpStream, theirs: &Handshake) -> Result<()> {
        if self.stop.is_cancelled() || self.cancel_upload.is_cancelled() {
            bail!("torrent {} is not uploading", self.metainfo.name());
        }
        let (peer, requests, cancels) =
            Peer::accept(stream, theirs, self.own_peer_id, self.metainfo.piece_count()).await?;
        if let Err(e) = peer.send_bitfield(self.bitfield.clone_bytes()).await {
            peer.close().await;
            return Err(e.context(format!("could not send bitfield to peer {}", peer.addr)));
        }
        log::debug!("accepted connection from peer {peer}");
        if let Some(previous) = self.leechers.insert(peer.addr.clone(), peer.clone()) {
            previous.close().await;
        }
        self.tasks
            .spawn(handle_requests(self.clone(), peer.clone(), requests, cancels));
        self.tasks.spawn(keep_alive_leecher(self.clone(), peer));
        Ok(())
    }

    /// Waits until every piece is verified. Fails if the torrent is stopped or cancelled first.
    pub async fn wait_until_downloaded(&self) -> Result<()> {
        tokio::select! {
            _ = self.completed.cancelled() => Ok(()),
            _ = self.stop.cancelled() => bail!("torrent {} stopped before completion", self.metainfo.name()),
            _ = self.cancel.cancelled() => bail!("torrent {} cancelled before completion", self.metainfo.name()),
        }
    }

    /// Rebuilds the torrent files from the verified pieces.
    pub async fn assemble(&self) -> Result<PathBuf> {
        if !self.bitfield.is_complete() {
            bail!(
                "cannot assemble {}: {} pieces missing",
                self.metainfo.name(),
                self.bitfield.missing_pieces().len()
            );
        }
        self.file_manager.assemble().await
    }

    /// Aborts download and upload and waits for every task to end.
    pub async fn cancel_download(&self) {
        log::info!("cancelling torrent {}", self.metainfo.name());
        self.cancel.cancel();
        self.cancel_upload.cancel();
        self.shutdown().await;
    }

    /// Stops the torrent and waits for every task to end.
    pub async fn close(&self) {
        self.stop.cancel();
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        let peers: Vec<Arc<Peer>> = self
            .seeders
            .iter()
            .chain(self.leechers.iter())
            .map(|p| p.value().clone())
            .collect();
        for peer in peers {
            peer.close().await;
        }
        self.seeders.clear();
        self.leechers.clear();
        log::info!("torrent stopped: {self}");
    }
}
