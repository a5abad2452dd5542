use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use size::Size;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep};

use crate::manager::bandwidth_tracker::BandwidthTracker;
use crate::manager::peer::{Peer, PeerAddr};
use crate::manager::pending_piece::{BlockOutcome, PendingPiece};
use crate::manager::torrent_manager::TorrentManager;
use crate::torrent_protocol::wire_protocol::Block;
use crate::util::sha1_hash;

/// Maximum number of pieces downloaded at the same time.
pub const DOWNLOAD_SLOTS: usize = 8;
/// A requested block not received within this time is requested again.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
/// How often connections are checked, re-established or kept alive.
pub const LIVENESS_TICK: Duration = Duration::from_secs(120);
/// Pause of the scheduler when a pass found nothing to do.
pub const SCHEDULER_BACKOFF: Duration = Duration::from_millis(200);
const RATE_TICK: Duration = Duration::from_secs(1);

/// A piece occupying a download slot. The index is readable without taking the piece lock.
#[derive(Debug)]
pub struct PieceInProgress {
    pub index: u32,
    pub piece: Mutex<PendingPiece>,
}

impl PieceInProgress {
    pub fn new(index: u32, size: u64) -> Self {
        PieceInProgress {
            index,
            piece: Mutex::new(PendingPiece::new(index, size)),
        }
    }
}

/// Scheduler loop of a torrent: keeps the download slots busy until every piece is verified,
/// then fires the completed signal.
pub async fn request_pieces(tm: Arc<TorrentManager>) {
    let mut missing = tm.bitfield.missing_pieces();
    log::debug!(
        "{}: scheduler started, {} pieces to download",
        tm.metainfo.name(),
        missing.len()
    );
    loop {
        if tm.stop.is_cancelled() || tm.cancel.is_cancelled() {
            break;
        }

        reclaim_stalled_blocks(&tm).await;
        let sent = dispatch_pending_blocks(&tm).await;

        if missing.is_empty() && tm.download_slots.is_empty() {
            log::info!("{}: all pieces downloaded", tm.metainfo.name());
            tm.completed.cancel();
            break;
        }

        let admitted = admit_piece(&tm, &mut missing);
        if sent == 0 && !admitted {
            tokio::select! {
                _ = tm.stop.cancelled() => break,
                _ = tm.cancel.cancelled() => break,
                _ = sleep(SCHEDULER_BACKOFF) => {}
            }
        }
    }
    log::debug!("{}: scheduler stopped", tm.metainfo.name());
}

/// Moves every expired in-flight request back to pending and cancels it on the peer it was sent
/// to, if that peer can still be reached.
async fn reclaim_stalled_blocks(tm: &TorrentManager) {
    for (_, slot) in tm.download_slots.occupied() {
        let expired = slot.piece.lock().await.reclaim_expired(REQUEST_TIMEOUT);
        for (addr, request) in expired {
            log::debug!("request ({request}) to peer {addr} timed out, it will be sent again");
            let Some(peer) = tm.seeders.get(&addr).map(|p| p.value().clone()) else {
                continue;
            };
            if !peer.can_serve_requests() {
                continue;
            }
            if let Err(e) = peer.send_cancel(&request).await {
                log::debug!("could not cancel request ({request}) to peer {addr}: {e:#}");
            }
        }
    }
}

fn pick_random(peers: &[Arc<Peer>]) -> Option<Arc<Peer>> {
    peers.choose(&mut rand::rng()).cloned()
}

/// Sends every pending block to a random peer that is unchoking us and has the piece. Returns
/// the number of requests sent.
///
/// The piece lock is held while sending so that a fast reply cannot be processed before its
/// request is recorded as in flight.
async fn dispatch_pending_blocks(tm: &TorrentManager) -> usize {
    let mut sent = 0;
    for (_, slot) in tm.download_slots.occupied() {
        let mut piece = slot.piece.lock().await;
        if piece.pending.is_empty() {
            continue;
        }
        let eligible: Vec<Arc<Peer>> = tm
            .seeders
            .iter()
            .filter(|p| p.can_serve_requests() && p.bitfield.check(slot.index))
            .map(|p| p.value().clone())
            .collect();
        for request in piece.pending.clone() {
            let Some(peer) = pick_random(&eligible) else {
                break;
            };
            match peer.send_request(&request).await {
                Ok(()) => {
                    piece.mark_sent(&request, &peer.addr);
                    sent += 1;
                }
                Err(e) => log::debug!("could not send request ({request}) to peer {}: {e:#}", peer.addr),
            }
        }
    }
    sent
}

/// Claims a free slot for the first missing piece some connected peer has.
fn admit_piece(tm: &TorrentManager, missing: &mut Vec<u32>) -> bool {
    if !tm.download_slots.has_free() {
        return false;
    }
    let Some(pos) = missing.iter().position(|idx| {
        tm.seeders
            .iter()
            .any(|p| p.is_established() && p.bitfield.check(*idx))
    }) else {
        return false;
    };
    let index = missing[pos];
    let size = tm.metainfo.piece_size(index);
    match tm
        .download_slots
        .claim(Arc::new(PieceInProgress::new(index, size)))
    {
        Some(slot_idx) => {
            missing.remove(pos);
            log::debug!("piece {index} ({}) assigned to slot {slot_idx}", Size::from_bytes(size));
            true
        }
        None => false,
    }
}

/// Consumes the blocks delivered by one seeder.
pub async fn recv_pieces(tm: Arc<TorrentManager>, peer: Arc<Peer>, mut pieces: Receiver<Block>) {
    loop {
        let block = tokio::select! {
            _ = tm.stop.cancelled() => break,
            _ = tm.cancel.cancelled() => break,
            block = pieces.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };
        handle_block(&tm, &peer.addr, block).await;
    }
    log::trace!("stopped receiving pieces from peer {}", peer.addr);
}

/// Accounts for one block and, when it completes its piece, verifies and persists the piece.
///
/// A piece failing verification or persistence stays in its slot with every block queued again,
/// and its bytes are subtracted from the downloaded total.
pub async fn handle_block(tm: &TorrentManager, from: &PeerAddr, block: Block) {
    let Some((slot_idx, slot)) = tm.download_slots.find(|s| s.index == block.piece_idx) else {
        log::trace!(
            "dropping block ({}) from peer {from}: piece is not being downloaded",
            block.request()
        );
        return;
    };
    let block_len = block.data.len() as u64;
    let mut piece = slot.piece.lock().await;
    match piece.accept(block) {
        BlockOutcome::Untracked => {
            log::trace!("dropping block of piece {} from peer {from}: not requested", slot.index);
            return;
        }
        BlockOutcome::Duplicate => {
            log::trace!("dropping duplicate block of piece {} from peer {from}", slot.index);
            return;
        }
        BlockOutcome::Accepted { piece_complete } => {
            tm.downloaded.fetch_add(block_len, Ordering::AcqRel);
            if !piece_complete {
                return;
            }
        }
    }

    let data = piece.assemble();
    if sha1_hash(&data) != tm.metainfo.pieces[slot.index as usize] {
        log::warn!(
            "piece {} failed hash verification, it will be downloaded again",
            slot.index
        );
        tm.downloaded.fetch_sub(piece.size, Ordering::AcqRel);
        piece.retry();
        return;
    }
    if let Err(e) = tm.file_manager.flush(slot.index, &data).await {
        log::error!(
            "could not save piece {}, it will be downloaded again: {e:#}",
            slot.index
        );
        tm.downloaded.fetch_sub(piece.size, Ordering::AcqRel);
        piece.retry();
        return;
    }
    tm.bitfield.set(slot.index);
    drop(piece);

    if !tm.download_slots.release(slot_idx, &slot) {
        log::warn!("slot {slot_idx} of piece {} was already freed", slot.index);
    }
    broadcast_have(tm, slot.index).await;

    let completed = tm.bitfield.count_set();
    let total = tm.metainfo.piece_count();
    log::info!(
        "{}: piece {} completed, {completed}/{total} pieces ({:.2}%)",
        tm.metainfo.name(),
        slot.index,
        completed as f64 * 100. / total as f64
    );
}

async fn broadcast_have(tm: &TorrentManager, piece_idx: u32) {
    let peers: Vec<Arc<Peer>> = tm
        .seeders
        .iter()
        .chain(tm.leechers.iter())
        .filter(|p| p.is_established())
        .map(|p| p.value().clone())
        .collect();
    for peer in peers {
        if let Err(e) = peer.send_have(piece_idx).await {
            log::debug!("could not send have {piece_idx} to peer {}: {e:#}", peer.addr);
        }
    }
}

/// Keeps the connection with one seeder address alive, dialing it again whenever it is lost,
/// until the torrent stops, is cancelled or completes.
pub async fn keep_alive_seeder(tm: Arc<TorrentManager>, addr: PeerAddr) {
    let mut ticker = interval(LIVENESS_TICK);
    loop {
        tokio::select! {
            _ = tm.stop.cancelled() => break,
            _ = tm.cancel.cancelled() => break,
            _ = tm.completed.cancelled() => break,
            _ = ticker.tick() => {}
        }
        check_seeder(&tm, &addr).await;
    }

    if let Some((_, peer)) = tm.seeders.remove(&addr) {
        if peer.is_established() && peer.am_interested() {
            if let Err(e) = peer.send_not_interested().await {
                log::trace!("could not send not interested to peer {addr}: {e:#}");
            }
        }
        peer.close().await;
    }
    log::trace!("stopped keeping alive peer {addr}");
}

// sends a keep-alive to an established seeder, replaces a lost one with a fresh connection
async fn check_seeder(tm: &Arc<TorrentManager>, addr: &PeerAddr) {
    let current = tm.seeders.get(addr).map(|p| p.value().clone());
    match current {
        Some(peer) if peer.is_established() => {
            if let Err(e) = peer.send_keep_alive().await {
                log::debug!("keep-alive failed with peer {addr}: {e:#}");
                peer.close().await;
            }
        }
        stale => {
            if let Some(peer) = stale {
                peer.close().await;
            }
            connect_seeder(tm, addr).await;
        }
    }
}

async fn connect_seeder(tm: &Arc<TorrentManager>, addr: &PeerAddr) {
    let (peer, pieces) = match Peer::connect(
        addr,
        tm.metainfo.info_hash,
        tm.own_peer_id,
        tm.metainfo.piece_count(),
    )
    .await
    {
        Ok(connected) => connected,
        Err(e) => {
            log::debug!("could not connect to peer {addr}: {e:#}");
            return;
        }
    };
    log::debug!("connected to peer {peer}");
    tm.seeders.insert(addr.clone(), peer.clone());
    tm.tasks.spawn(recv_pieces(tm.clone(), peer.clone(), pieces));
    if let Err(e) = peer.send_bitfield(tm.bitfield.clone_bytes()).await {
        log::debug!("could not send bitfield to peer {addr}: {e:#}");
        return;
    }
    if let Err(e) = peer.send_interested().await {
        log::debug!("could not send interested to peer {addr}: {e:#}");
    }
}

/// Samples the transfer totals every second for the rate counter.
pub async fn sample_rates(tm: Arc<TorrentManager>) {
    let mut bandwidth = BandwidthTracker::new();
    let mut ticker = interval(RATE_TICK);
    loop {
        tokio::select! {
            _ = tm.stop.cancelled() => break,
            _ = tm.cancel_upload.cancelled() => break,
            _ = ticker.tick() => {}
        }
        bandwidth.update(
            tm.uploaded.load(Ordering::Acquire),
            tm.downloaded.load(Ordering::Acquire),
        );
        log::debug!(
            "{}: {bandwidth}, last second: {} down, {} up",
            tm.metainfo.name(),
            Size::from_bytes(bandwidth.rate_down()),
            Size::from_bytes(bandwidth.rate_up())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::Bitfield;
    use crate::manager::peer::tests::fake_remote;
    use crate::manager::torrent_manager::tests::new_manager;
    use crate::metadata::metainfo::tests::single_file_metainfo;
    use crate::torrent_protocol::wire_protocol::{
        BlockRequest, Message, ProtocolReadHalf, ProtocolWriteHalf,
    };
    use std::collections::HashSet;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::time::timeout;

    struct FakeSeeder {
        id: usize,
        info_hash: [u8; 20],
        content: Vec<u8>,
        piece_length: usize,
        has: Vec<u32>,
        serve: bool,
    }

    impl FakeSeeder {
        /// Serves one connection, reporting every request it gets.
        async fn run(
            self,
            listener: TcpListener,
            requests: UnboundedSender<(usize, BlockRequest)>,
        ) {
            let mut stream = fake_remote(&listener, self.info_hash, [self.id as u8; 20]).await;
            let piece_count = self.content.len().div_ceil(self.piece_length) as u32;
            let bitfield = Bitfield::new(piece_count);
            for idx in &self.has {
                bitfield.set(*idx);
            }
            stream.send(&Message::Bitfield(bitfield.clone_bytes())).await.unwrap();
            stream.send(&Message::Unchoke).await.unwrap();
            while let Ok(msg) = stream.receive().await {
                let Message::Request(r) = msg else {
                    continue;
                };
                _ = requests.send((self.id, r.clone()));
                if !self.serve {
                    continue;
                }
                let begin = r.piece_idx as usize * self.piece_length + r.block_begin as usize;
                let block = Block {
                    piece_idx: r.piece_idx,
                    block_begin: r.block_begin,
                    data: self.content[begin..begin + r.data_len as usize].to_vec(),
                };
                if stream.send(&Message::Piece(block)).await.is_err() {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn download_from_partial_seeders() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..40u8).collect();
        let tm = new_manager(single_file_metainfo("b.bin", &content, 16), dir.path()).await;
        let (tx, mut rx) = unbounded_channel();

        let advertised = [vec![0, 1], vec![1, 2]];
        let mut addrs = Vec::new();
        for (id, has) in advertised.iter().enumerate() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addrs.push(listener.local_addr().unwrap().to_string());
            let seeder = FakeSeeder {
                id,
                info_hash: tm.metainfo.info_hash,
                content: content.clone(),
                piece_length: 16,
                has: has.clone(),
                serve: true,
            };
            tokio::spawn(seeder.run(listener, tx.clone()));
        }

        tm.start();
        tm.update_seeders(addrs);
        timeout(Duration::from_secs(20), tm.wait_until_downloaded())
            .await
            .unwrap()
            .unwrap();

        assert!(tm.bitfield.is_complete());
        assert_eq!(tm.downloaded.load(Ordering::Acquire), 40);
        let mut requested = HashSet::new();
        while let Ok((id, r)) = rx.try_recv() {
            assert!(
                advertised[id].contains(&r.piece_idx),
                "seeder {id} was asked for piece {} it does not have",
                r.piece_idx
            );
            requested.insert(r.piece_idx);
        }
        assert_eq!(requested, HashSet::from([0, 1, 2]));

        let path = tm.assemble().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), content);
        tm.close().await;
    }

    #[tokio::test]
    async fn never_request_a_block_twice_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![1u8; 65536];
        let tm = new_manager(single_file_metainfo("c.bin", &content, 32768), dir.path()).await;
        let (tx, mut rx) = unbounded_channel();

        for id in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let seeder = FakeSeeder {
                id,
                info_hash: tm.metainfo.info_hash,
                content: content.clone(),
                piece_length: 32768,
                has: vec![0, 1],
                serve: false,
            };
            tokio::spawn(seeder.run(listener, tx.clone()));
            let (peer, _pieces) = Peer::connect(&addr, tm.metainfo.info_hash, [3; 20], 2)
                .await
                .unwrap();
            while !(peer.can_serve_requests() && peer.bitfield.is_complete()) {
                sleep(Duration::from_millis(10)).await;
            }
            tm.seeders.insert(addr, peer);
        }

        let mut missing = tm.bitfield.missing_pieces();
        assert!(admit_piece(&tm, &mut missing));
        assert!(admit_piece(&tm, &mut missing));
        assert!(missing.is_empty());
        assert_eq!(dispatch_pending_blocks(&tm).await, 4);
        assert_eq!(dispatch_pending_blocks(&tm).await, 0);

        let mut requested = Vec::new();
        while let Ok(Some((_, r))) = timeout(Duration::from_millis(500), rx.recv()).await {
            requested.push(r);
        }
        assert_eq!(requested.len(), 4);
        let unique: HashSet<BlockRequest> = requested.into_iter().collect();
        assert_eq!(unique.len(), 4);
        tm.close().await;
    }

    #[tokio::test]
    async fn lost_seeder_is_dialed_again() {
        let dir = tempfile::tempdir().unwrap();
        let tm = new_manager(single_file_metainfo("g.bin", &[1; 40], 16), dir.path()).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let info_hash = tm.metainfo.info_hash;

        let (_, mut remote) = tokio::join!(
            check_seeder(&tm, &addr),
            fake_remote(&listener, info_hash, [7; 20])
        );
        assert_eq!(remote.receive().await.unwrap(), Message::Bitfield(vec![0]));
        assert_eq!(remote.receive().await.unwrap(), Message::Interested);
        let first = tm.seeders.get(&addr).unwrap().value().clone();
        assert!(first.is_established());

        // an established seeder only gets a keep-alive
        check_seeder(&tm, &addr).await;
        assert_eq!(remote.receive().await.unwrap(), Message::KeepAlive);
        assert!(Arc::ptr_eq(&first, tm.seeders.get(&addr).unwrap().value()));

        drop(remote);
        timeout(Duration::from_secs(5), async {
            while first.is_established() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (_, mut remote) = tokio::join!(
            check_seeder(&tm, &addr),
            fake_remote(&listener, info_hash, [8; 20])
        );
        assert_eq!(remote.receive().await.unwrap(), Message::Bitfield(vec![0]));
        assert_eq!(remote.receive().await.unwrap(), Message::Interested);
        let second = tm.seeders.get(&addr).unwrap().value().clone();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_established());
        assert_eq!(second.id, [8; 20]);
        assert!(!first.is_established());
        tm.close().await;
    }

    async fn claim_and_send(tm: &TorrentManager, index: u32) -> Arc<PieceInProgress> {
        let slot = Arc::new(PieceInProgress::new(index, tm.metainfo.piece_size(index)));
        tm.download_slots.claim(slot.clone()).unwrap();
        let mut piece = slot.piece.lock().await;
        for r in piece.pending.clone() {
            piece.mark_sent(&r, &"127.0.0.1:6881".to_string());
        }
        drop(piece);
        slot
    }

    #[tokio::test]
    async fn stale_block_after_piece_completed_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..40u8).collect();
        let tm = new_manager(single_file_metainfo("d.bin", &content, 16), dir.path()).await;
        let from = "127.0.0.1:6881".to_string();
        claim_and_send(&tm, 0).await;

        let block = Block {
            piece_idx: 0,
            block_begin: 0,
            data: content[..16].to_vec(),
        };
        handle_block(&tm, &from, block.clone()).await;
        assert!(tm.bitfield.check(0));
        assert!(tm.download_slots.is_empty());
        assert_eq!(tm.downloaded.load(Ordering::Acquire), 16);

        handle_block(&tm, &from, block).await;
        assert_eq!(tm.downloaded.load(Ordering::Acquire), 16);
        assert_eq!(tm.bitfield.existing_pieces(), vec![0]);
    }

    #[tokio::test]
    async fn corrupted_piece_is_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![9u8; 40000];
        let tm = new_manager(single_file_metainfo("e.bin", &content, 32768), dir.path()).await;
        let from = "127.0.0.1:6881".to_string();
        let slot = claim_and_send(&tm, 0).await;
        let original = PendingPiece::new(0, 32768).pending;

        handle_block(
            &tm,
            &from,
            Block {
                piece_idx: 0,
                block_begin: 0,
                data: vec![9; 16384],
            },
        )
        .await;
        // counted before verification
        assert_eq!(tm.downloaded.load(Ordering::Acquire), 16384);

        handle_block(
            &tm,
            &from,
            Block {
                piece_idx: 0,
                block_begin: 16384,
                data: vec![0; 16384],
            },
        )
        .await;
        assert_eq!(tm.downloaded.load(Ordering::Acquire), 0);
        assert!(!tm.bitfield.check(0));

        let piece = slot.piece.lock().await;
        assert_eq!(piece.pending, original);
        assert!(piece.in_flight.is_empty());
        assert!(piece.received.is_empty());
        assert_matches!(tm.download_slots.find(|s| s.index == 0), Some(_));
    }
}
