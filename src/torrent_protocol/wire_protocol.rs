use std::fmt;

use anyhow::Result;
use thiserror::Error;

use crate::util::{force_string, pretty_info_hash};

/// Largest block a peer may request, also the size of the blocks this client requests.
pub const BLOCK_SIZE: u32 = 16384;
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING.len() + 8 + 20 + 20;

#[derive(Eq, PartialEq, Hash, Clone, Debug)]
pub struct BlockRequest {
    pub piece_idx: u32,
    pub block_begin: u32,
    pub data_len: u32,
}

impl BlockRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.data_len == 0 || self.data_len > BLOCK_SIZE {
            return Err(ProtocolError::InvalidRequestLength(self.data_len));
        }
        Ok(())
    }
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "piece idx: {}, begin: {}, length: {}",
            self.piece_idx, self.block_begin, self.data_len
        )
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Block {
    pub piece_idx: u32,
    pub block_begin: u32,
    pub data: Vec<u8>,
}

impl Block {
    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            piece_idx: self.piece_idx,
            block_begin: self.block_begin,
            data_len: self.data.len() as u32,
        }
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),        // piece index
    Bitfield(Vec<u8>), // the high bit in the first byte corresponds to piece index 0
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16), // DHT port number
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(piece_idx) => write!(f, "have piece id {piece_idx}"),
            Message::Bitfield(bitfield) => {
                let total_have: u32 = bitfield.iter().map(|b| b.count_ones()).sum();
                write!(
                    f,
                    "bitfield have {total_have} total: {} (bitfield comes in bytes, number of pieces could be less)",
                    bitfield.len() * 8
                )
            }
            Message::Request(block_request) => write!(f, "request: {block_request}"),
            Message::Piece(block) => write!(
                f,
                "piece: piece idx: {}, begin: {}, data len: {}",
                block.piece_idx,
                block.block_begin,
                block.data.len()
            ),
            Message::Cancel(block_request) => write!(f, "cancel: {block_request}"),
            Message::Port(p) => write!(f, "port {p}"),
        }
    }
}

fn be_u32(buf: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[..4]);
    u32::from_be_bytes(b)
}

fn parse_block_request(payload: &[u8]) -> BlockRequest {
    BlockRequest {
        piece_idx: be_u32(&payload[0..4]),
        block_begin: be_u32(&payload[4..8]),
        data_len: be_u32(&payload[8..12]),
    }
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(_) => Some(6),
            Message::Piece(_) => Some(7),
            Message::Cancel(_) => Some(8),
            Message::Port(_) => Some(9),
        }
    }

    /// Full frame: big endian length prefix, message id and payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(piece_idx) => payload.extend_from_slice(&piece_idx.to_be_bytes()),
            Message::Bitfield(bitfield) => payload.extend_from_slice(bitfield),
            Message::Request(r) | Message::Cancel(r) => {
                payload.extend_from_slice(&r.piece_idx.to_be_bytes());
                payload.extend_from_slice(&r.block_begin.to_be_bytes());
                payload.extend_from_slice(&r.data_len.to_be_bytes());
            }
            Message::Piece(block) => {
                payload.extend_from_slice(&block.piece_idx.to_be_bytes());
                payload.extend_from_slice(&block.block_begin.to_be_bytes());
                payload.extend_from_slice(&block.data);
            }
            Message::Port(port) => payload.extend_from_slice(&port.to_be_bytes()),
        }
        let Some(id) = self.id() else {
            return vec![0; 4];
        };
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        buf.push(id);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Parses the body of a frame, i.e. what follows the length prefix and the message id.
    pub fn parse(id: u8, payload: Vec<u8>) -> Result<Message, ProtocolError> {
        let expect_len = |len: usize| {
            if payload.len() != len {
                Err(ProtocolError::InvalidLength {
                    id,
                    len: payload.len(),
                })
            } else {
                Ok(())
            }
        };
        match id {
            0 => expect_len(0).map(|_| Message::Choke),
            1 => expect_len(0).map(|_| Message::Unchoke),
            2 => expect_len(0).map(|_| Message::Interested),
            3 => expect_len(0).map(|_| Message::NotInterested),
            4 => {
                expect_len(4)?;
                Ok(Message::Have(be_u32(&payload)))
            }
            5 => Ok(Message::Bitfield(payload)),
            6 | 8 => {
                expect_len(12)?;
                let request = parse_block_request(&payload);
                request.validate()?;
                Ok(if id == 6 {
                    Message::Request(request)
                } else {
                    Message::Cancel(request)
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(ProtocolError::InvalidLength {
                        id,
                        len: payload.len(),
                    });
                }
                Ok(Message::Piece(Block {
                    piece_idx: be_u32(&payload[0..4]),
                    block_begin: be_u32(&payload[4..8]),
                    data: payload[8..].to_vec(),
                }))
            }
            9 => {
                expect_len(2)?;
                Ok(Message::Port(u16::from_be_bytes([payload[0], payload[1]])))
            }
            unknown_message_id => Err(ProtocolError::UnknownMessageId(unknown_message_id)),
        }
    }
}

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "handshake: info hash: {}, peer id: {}",
            pretty_info_hash(self.info_hash),
            force_string(&self.peer_id)
        )
    }
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ProtocolError::InvalidHandshake(format!(
                "expected {HANDSHAKE_LEN} bytes, got {}",
                buf.len()
            )));
        }
        if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
            return Err(ProtocolError::InvalidHandshake(format!(
                "unsupported protocol string \"{}\"",
                force_string(&buf[1..20])
            )));
        }
        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }
}

#[trait_variant::make(Send)]
pub trait Protocol {
    /// Sends our handshake and reads the remote one concurrently.
    async fn handshake(&mut self, ours: &Handshake) -> Result<Handshake>;
}

#[trait_variant::make(Send)]
pub trait ProtocolReadHalf {
    async fn receive(&mut self) -> Result<Message>;
    async fn receive_handshake(&mut self) -> Result<Handshake>;
}

#[trait_variant::make(Send)]
pub trait ProtocolWriteHalf {
    async fn send(&mut self, message: &Message) -> Result<()>;
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<()>;
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("could not parse message type id: {0}")]
    UnknownMessageId(u8),
    #[error("invalid payload length {len} for message id {id}")]
    InvalidLength { id: u8, len: usize },
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLong(u32),
    #[error("requested block length {0} is not between 1 and {BLOCK_SIZE}")]
    InvalidRequestLength(u32),
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ConnectionError {
    #[error("connection is not established")]
    NotEstablished,
}
