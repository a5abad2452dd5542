use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bitfield::Bitfield;
use crate::torrent_protocol::wire_protocol::{
    Block, BlockRequest, ConnectionError, Handshake, Message, Protocol, ProtocolReadHalf,
    ProtocolWriteHalf,
};
use crate::util::{force_string, pretty_info_hash};

/// Deadline for dialing, handshaking and writing a single message.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// A peer that sends nothing, not even keep-alives, for this long is dropped.
pub const READ_TIMEOUT: Duration = Duration::from_secs(180);
const DELIVERY_CHANNEL_CAPACITY: usize = 64;

pub type PeerAddr = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Established = 0,
    Killed = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// we dialed it and download pieces from it
    Seeder,
    /// it dialed us and we upload pieces to it
    Leecher,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerRole::Seeder => write!(f, "seeder"),
            PeerRole::Leecher => write!(f, "leecher"),
        }
    }
}

enum Delivery {
    Seeder(Sender<Block>),
    Leecher {
        requests: Sender<BlockRequest>,
        cancels: Sender<BlockRequest>,
    },
}

/// One connection with a remote peer.
///
/// The receive loop owns the read half of the socket, sends go through the write half guarded by
/// `writer`. A killed peer is never revived: reconnecting creates a new `Peer`.
pub struct Peer {
    pub id: [u8; 20],
    pub addr: PeerAddr,
    pub role: PeerRole,
    status: AtomicU8,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    peer_choking: AtomicBool,
    peer_interested: AtomicBool,
    pub bitfield: Bitfield,
    writer: Mutex<OwnedWriteHalf>,
    receive_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} ({})", self.role, self.addr, force_string(&self.id))
    }
}

impl Peer {
    fn new(
        id: [u8; 20],
        addr: PeerAddr,
        role: PeerRole,
        piece_count: u32,
        writer: OwnedWriteHalf,
    ) -> Self {
        Peer {
            id,
            addr,
            role,
            status: AtomicU8::new(ConnectionStatus::Established as u8),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            bitfield: Bitfield::new(piece_count),
            writer: Mutex::new(writer),
            receive_loop: std::sync::Mutex::new(None),
        }
    }

    /// Dials `addr`, exchanges handshakes and starts the receive loop. Pieces sent by the remote
    /// peer are delivered on the returned channel.
    pub async fn connect(
        addr: &str,
        info_hash: [u8; 20],
        own_peer_id: [u8; 20],
        piece_count: u32,
    ) -> Result<(Arc<Peer>, Receiver<Block>)> {
        log::trace!("initiating connection to peer: {addr}");
        let mut stream = timeout(WRITE_TIMEOUT, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to peer {addr}"))?
            .with_context(|| format!("error initiating connection to peer {addr}"))?;

        let theirs = timeout(
            WRITE_TIMEOUT,
            stream.handshake(&Handshake::new(info_hash, own_peer_id)),
        )
        .await
        .with_context(|| format!("timed out completing handshake with peer {addr}"))??;
        log::trace!("received handshake from {addr}: {theirs}");
        if theirs.info_hash != info_hash {
            bail!(
                "info hash received during handshake does not match (own: {}, theirs: {})",
                pretty_info_hash(info_hash),
                pretty_info_hash(theirs.info_hash)
            );
        }

        let (read, write) = stream.into_split();
        let peer = Arc::new(Peer::new(
            theirs.peer_id,
            addr.to_string(),
            PeerRole::Seeder,
            piece_count,
            write,
        ));
        let (pieces_tx, pieces_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        peer.start_receive_loop(read, Delivery::Seeder(pieces_tx));
        Ok((peer, pieces_rx))
    }

    /// Completes a connection opened by a remote peer whose handshake was already read: replies
    /// with our handshake and starts the receive loop. Requests and cancels sent by the remote
    /// peer are delivered on the two returned channels.
    pub async fn accept(
        stream: TcpStream,
        theirs: &Handshake,
        own_peer_id: [u8; 20],
        piece_count: u32,
    ) -> Result<(Arc<Peer>, Receiver<BlockRequest>, Receiver<BlockRequest>)> {
        let addr = stream.peer_addr()?.to_string();
        let (read, mut write) = stream.into_split();
        timeout(
            WRITE_TIMEOUT,
            write.send_handshake(&Handshake::new(theirs.info_hash, own_peer_id)),
        )
        .await
        .with_context(|| format!("timed out sending handshake to peer {addr}"))??;

        let peer = Arc::new(Peer::new(
            theirs.peer_id,
            addr,
            PeerRole::Leecher,
            piece_count,
            write,
        ));
        let (requests_tx, requests_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let (cancels_tx, cancels_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        peer.start_receive_loop(
            read,
            Delivery::Leecher {
                requests: requests_tx,
                cancels: cancels_tx,
            },
        );
        Ok((peer, requests_rx, cancels_rx))
    }

    fn start_receive_loop(self: &Arc<Self>, read: OwnedReadHalf, delivery: Delivery) {
        let handle = tokio::spawn(rcv_message_handler(self.clone(), read, delivery));
        *self
            .receive_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::Acquire) {
            0 => ConnectionStatus::Established,
            _ => ConnectionStatus::Killed,
        }
    }

    pub fn is_established(&self) -> bool {
        self.status() == ConnectionStatus::Established
    }

    fn kill(&self) {
        self.status
            .store(ConnectionStatus::Killed as u8, Ordering::Release);
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Acquire)
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Acquire)
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Acquire)
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Acquire)
    }

    /// Established and not choking us: requests sent now are expected to be served.
    pub fn can_serve_requests(&self) -> bool {
        self.is_established() && !self.peer_choking()
    }

    /// Marks the connection as killed, closes the socket and waits for the receive loop to end.
    pub async fn close(&self) {
        self.kill();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::trace!("peer {}: error shutting down connection: {e}", self.addr);
        }
        drop(writer);
        let handle = self
            .receive_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            _ = handle.await;
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        if !self.is_established() {
            bail!(ConnectionError::NotEstablished);
        }
        log::trace!("sending message {message} to peer {}", self.addr);
        let mut writer = self.writer.lock().await;
        match timeout(WRITE_TIMEOUT, writer.send(&message)).await {
            Err(_elapsed) => {
                self.kill();
                bail!("timeout sending message to peer {}", self.addr);
            }
            Ok(Err(e)) => {
                self.kill();
                Err(e.context(format!("sending failed with peer {}", self.addr)))
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    pub async fn send_keep_alive(&self) -> Result<()> {
        self.send(Message::KeepAlive).await
    }

    pub async fn send_choke(&self) -> Result<()> {
        self.send(Message::Choke).await?;
        self.am_choking.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn send_unchoke(&self) -> Result<()> {
        self.send(Message::Unchoke).await?;
        self.am_choking.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn send_interested(&self) -> Result<()> {
        self.send(Message::Interested).await?;
        self.am_interested.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn send_not_interested(&self) -> Result<()> {
        self.send(Message::NotInterested).await?;
        self.am_interested.store(false, Ordering::Release);
        Ok(())
    }

    pub async fn send_bitfield(&self, bitfield: Vec<u8>) -> Result<()> {
        self.send(Message::Bitfield(bitfield)).await
    }

    pub async fn send_have(&self, piece_idx: u32) -> Result<()> {
        self.send(Message::Have(piece_idx)).await
    }

    pub async fn send_request(&self, request: &BlockRequest) -> Result<()> {
        request.validate().context("invalid request")?;
        self.send(Message::Request(request.clone())).await
    }

    pub async fn send_cancel(&self, request: &BlockRequest) -> Result<()> {
        request.validate().context("invalid cancel")?;
        self.send(Message::Cancel(request.clone())).await
    }

    pub async fn send_piece(&self, block: Block) -> Result<()> {
        self.send(Message::Piece(block)).await
    }
}

async fn rcv_message_handler(peer: Arc<Peer>, mut read: OwnedReadHalf, delivery: Delivery) {
    loop {
        let proto_msg = match timeout(READ_TIMEOUT, read.receive()).await {
            Err(_elapsed) => {
                log::trace!(
                    "did not receive anything (not even keep-alive messages) from peer {} in {} seconds",
                    peer.addr,
                    READ_TIMEOUT.as_secs()
                );
                break;
            }
            Ok(Err(e)) => {
                log::trace!("receive failed with peer {}: {e:#}", peer.addr);
                break;
            }
            Ok(Ok(proto_msg)) => proto_msg,
        };
        log::trace!("received from {}: {proto_msg}", peer.addr);
        let delivered = match (proto_msg, &delivery) {
            (Message::KeepAlive, _) | (Message::Port(_), _) => true,
            (Message::Choke, _) => {
                peer.peer_choking.store(true, Ordering::Release);
                true
            }
            (Message::Unchoke, _) => {
                peer.peer_choking.store(false, Ordering::Release);
                true
            }
            (Message::Interested, _) => {
                peer.peer_interested.store(true, Ordering::Release);
                true
            }
            (Message::NotInterested, _) => {
                peer.peer_interested.store(false, Ordering::Release);
                true
            }
            (Message::Have(piece_idx), _) => {
                if let Err(e) = peer.bitfield.set_with_check(piece_idx) {
                    log::debug!("peer {} sent an invalid have: {e}", peer.addr);
                }
                true
            }
            (Message::Bitfield(raw), _) => match peer.bitfield.overwrite(&raw) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("peer {} sent an invalid bitfield: {e}", peer.addr);
                    false
                }
            },
            (Message::Piece(block), Delivery::Seeder(pieces)) => pieces.send(block).await.is_ok(),
            (Message::Request(request), Delivery::Leecher { requests, .. }) => {
                requests.send(request).await.is_ok()
            }
            (Message::Cancel(request), Delivery::Leecher { cancels, .. }) => {
                cancels.send(request).await.is_ok()
            }
            (proto_msg, _) => {
                log::trace!(
                    "ignoring {proto_msg} from peer {}, unexpected for a {}",
                    peer.addr,
                    peer.role
                );
                true
            }
        };
        if !delivered {
            break;
        }
    }
    peer.kill();
    log::debug!("receive loop ended for peer {}", peer.addr);
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers the handshake, returning the socket to the caller.
    pub async fn fake_remote(
        listener: &TcpListener,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let theirs = stream.receive_handshake().await.unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        stream
            .send_handshake(&Handshake::new(info_hash, peer_id))
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn connect_tracks_remote_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let remote = tokio::spawn(async move {
            let mut stream = fake_remote(&listener, [1; 20], [2; 20]).await;
            stream.send(&Message::Bitfield(vec![0b1010_0000])).await.unwrap();
            stream.send(&Message::Have(1)).await.unwrap();
            stream.send(&Message::Unchoke).await.unwrap();
            stream
                .send(&Message::Piece(Block {
                    piece_idx: 0,
                    block_begin: 0,
                    data: vec![5; 10],
                }))
                .await
                .unwrap();
            assert_eq!(stream.receive().await.unwrap(), Message::Interested);
            stream
        });

        let (peer, mut pieces) = Peer::connect(&addr, [1; 20], [3; 20], 3).await.unwrap();
        assert_eq!(peer.id, [2; 20]);
        assert_eq!(peer.role, PeerRole::Seeder);
        let block = pieces.recv().await.unwrap();
        assert_eq!(block.data, vec![5; 10]);
        // state messages were sent before the piece and are handled in order
        assert_eq!(peer.bitfield.existing_pieces(), vec![0, 1, 2]);
        assert!(peer.can_serve_requests());

        assert!(!peer.am_interested());
        peer.send_interested().await.unwrap();
        assert!(peer.am_interested());
        let _stream = remote.await.unwrap();

        peer.close().await;
        assert_eq!(peer.status(), ConnectionStatus::Killed);
        let err = peer.send_keep_alive().await.unwrap_err();
        assert_matches!(
            err.downcast_ref::<ConnectionError>(),
            Some(ConnectionError::NotEstablished)
        );
    }

    #[tokio::test]
    async fn connect_rejects_other_torrent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = stream.receive_handshake().await;
            let _ = stream
                .send_handshake(&Handshake::new([9; 20], [2; 20]))
                .await;
        });
        assert!(Peer::connect(&addr, [1; 20], [3; 20], 3).await.is_err());
    }

    #[tokio::test]
    async fn remote_close_kills_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let remote = tokio::spawn(async move { fake_remote(&listener, [1; 20], [2; 20]).await });
        let (peer, mut pieces) = Peer::connect(&addr, [1; 20], [3; 20], 3).await.unwrap();
        drop(remote.await.unwrap());
        assert!(pieces.recv().await.is_none());
        assert_eq!(peer.status(), ConnectionStatus::Killed);
    }

    #[tokio::test]
    async fn accept_delivers_requests_and_cancels() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .send_handshake(&Handshake::new([1; 20], [2; 20]))
                .await
                .unwrap();
            let reply = stream.receive_handshake().await.unwrap();
            assert_eq!(reply.peer_id, [3; 20]);
            let request = BlockRequest {
                piece_idx: 0,
                block_begin: 0,
                data_len: 4,
            };
            stream.send(&Message::Interested).await.unwrap();
            stream.send(&Message::Request(request.clone())).await.unwrap();
            stream.send(&Message::Cancel(request)).await.unwrap();
            stream
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let theirs = stream.receive_handshake().await.unwrap();
        let (peer, mut requests, mut cancels) =
            Peer::accept(stream, &theirs, [3; 20], 1).await.unwrap();
        assert_eq!(peer.role, PeerRole::Leecher);
        assert_eq!(requests.recv().await.unwrap().data_len, 4);
        assert_eq!(cancels.recv().await.unwrap().data_len, 4);
        assert!(peer.peer_interested());
        let _stream = remote.await.unwrap();
        peer.close().await;
    }
}
