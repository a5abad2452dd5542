use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, sleep, Duration};

use crate::manager::peer::Peer;
use crate::manager::piece_requestor::{LIVENESS_TICK, SCHEDULER_BACKOFF};
use crate::manager::torrent_manager::TorrentManager;
use crate::torrent_protocol::wire_protocol::{Block, BlockRequest};

/// Maximum number of block requests waiting to be served.
pub const UPLOAD_SLOTS: usize = 16;
const INTEREST_POLL: Duration = Duration::from_secs(1);

/// A block requested by a leecher.
pub struct PendingUpload {
    pub peer: Arc<Peer>,
    pub request: BlockRequest,
}

/// Takes the requests and cancels of one leecher into the upload slots.
pub async fn handle_requests(
    tm: Arc<TorrentManager>,
    peer: Arc<Peer>,
    mut requests: Receiver<BlockRequest>,
    mut cancels: Receiver<BlockRequest>,
) {
    loop {
        tokio::select! {
            _ = tm.stop.cancelled() => break,
            _ = tm.cancel_upload.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => {
                    accept_request(&tm, &peer, request);
                }
                None => break,
            },
            cancel = cancels.recv() => match cancel {
                Some(request) => cancel_request(&tm, &peer, &request),
                None => break,
            },
        }
    }
    log::trace!("stopped handling requests from peer {}", peer.addr);
}

fn accept_request(tm: &TorrentManager, peer: &Arc<Peer>, request: BlockRequest) -> bool {
    if peer.am_choking() {
        log::debug!("peer {} requested ({request}) while choked, ignoring", peer.addr);
        return false;
    }
    if !tm.bitfield.check(request.piece_idx) {
        log::debug!(
            "peer {} requested ({request}) but the piece is not available",
            peer.addr
        );
        return false;
    }
    let upload = Arc::new(PendingUpload {
        peer: peer.clone(),
        request,
    });
    match tm.upload_slots.claim(upload.clone()) {
        Some(_) => true,
        None => {
            log::debug!(
                "no free upload slot, dropping request ({}) from peer {}",
                upload.request,
                peer.addr
            );
            false
        }
    }
}

fn cancel_request(tm: &TorrentManager, peer: &Peer, request: &BlockRequest) {
    for (idx, upload) in tm.upload_slots.occupied() {
        if upload.peer.addr == peer.addr && upload.request == *request {
            tm.upload_slots.release(idx, &upload);
        }
    }
}

/// Serves the requests held in the upload slots. A slot is freed whether or not its block was
/// sent.
pub async fn serve_uploads(tm: Arc<TorrentManager>) {
    loop {
        if tm.stop.is_cancelled() || tm.cancel_upload.is_cancelled() {
            break;
        }
        let occupied = tm.upload_slots.occupied();
        if occupied.is_empty() {
            tokio::select! {
                _ = tm.stop.cancelled() => break,
                _ = tm.cancel_upload.cancelled() => break,
                _ = sleep(SCHEDULER_BACKOFF) => continue,
            }
        }
        for (idx, upload) in occupied {
            serve(&tm, &upload).await;
            tm.upload_slots.release(idx, &upload);
        }
    }
    log::debug!("{}: upload server stopped", tm.metainfo.name());
}

async fn serve(tm: &TorrentManager, upload: &PendingUpload) {
    let request = &upload.request;
    let data = match tm.file_manager.read_block(request).await {
        Ok(data) => data,
        Err(e) => {
            log::warn!("could not read block ({request}) for peer {}: {e:#}", upload.peer.addr);
            return;
        }
    };
    let len = data.len() as u64;
    let block = Block {
        piece_idx: request.piece_idx,
        block_begin: request.block_begin,
        data,
    };
    match upload.peer.send_piece(block).await {
        Ok(()) => {
            tm.uploaded.fetch_add(len, Ordering::AcqRel);
        }
        Err(e) => log::debug!("could not send block ({request}) to peer {}: {e:#}", upload.peer.addr),
    }
}

/// Keeps an inbound connection alive, unchokes the leecher while it is interested and chokes it
/// again when it loses interest. Inbound connections are never dialed again: the task ends with
/// the connection.
pub async fn keep_alive_leecher(tm: Arc<TorrentManager>, peer: Arc<Peer>) {
    let mut keep_alive = interval(LIVENESS_TICK);
    keep_alive.tick().await;
    let mut interest = interval(INTEREST_POLL);
    loop {
        tokio::select! {
            _ = tm.stop.cancelled() => break,
            _ = tm.cancel_upload.cancelled() => break,
            _ = keep_alive.tick() => {
                if let Err(e) = peer.send_keep_alive().await {
                    log::debug!("keep-alive failed with peer {}: {e:#}", peer.addr);
                    break;
                }
            }
            _ = interest.tick() => {
                if !peer.is_established() {
                    break;
                }
                let result = match (peer.peer_interested(), peer.am_choking()) {
                    (true, true) => peer.send_unchoke().await,
                    (false, false) => peer.send_choke().await,
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    log::debug!("could not update choke state of peer {}: {e:#}", peer.addr);
                    break;
                }
            }
        }
    }

    tm.leechers
        .remove_if(&peer.addr, |_, current| Arc::ptr_eq(current, &peer));
    if peer.is_established() {
        if let Err(e) = peer.send_not_interested().await {
            log::trace!("could not send not interested to peer {}: {e:#}", peer.addr);
        }
    }
    peer.close().await;
    log::debug!("connection with peer {} closed", peer.addr);
}
