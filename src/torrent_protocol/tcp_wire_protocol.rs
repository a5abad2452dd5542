use anyhow::{bail, Result};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    join,
    net::TcpStream,
};

use crate::torrent_protocol::wire_protocol::{
    Handshake, Message, Protocol, ProtocolError, ProtocolReadHalf, ProtocolWriteHalf, BLOCK_SIZE,
    HANDSHAKE_LEN,
};

// a piece message carrying a full block plus some slack; bitfields of very large torrents fit too
const MAX_FRAME_LEN: u32 = 1 << 21;

impl Protocol for TcpStream {
    async fn handshake(&mut self, ours: &Handshake) -> Result<Handshake> {
        let peer_addr = self.peer_addr()?;
        log::trace!("peer {peer_addr}: performing handshake");

        let (mut read, mut write) = self.split();
        let (write_result, read_result) = join!(
            write.send_handshake(ours),
            read.receive_handshake()
        );
        write_result?;
        let theirs = read_result?;
        log::trace!("peer {peer_addr}: full handshake received");
        Ok(theirs)
    }
}

impl<T: AsyncWrite + Unpin + Send> ProtocolWriteHalf for T {
    async fn send(&mut self, message: &Message) -> Result<()> {
        self.write_all(&message.serialize()).await?;
        Ok(())
    }

    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        self.write_all(&handshake.serialize()).await?;
        Ok(())
    }
}

impl<T: AsyncRead + Unpin + Send> ProtocolReadHalf for T {
    async fn receive(&mut self) -> Result<Message> {
        // get size of message
        let mut size_message_buf = [0u8; 4];
        self.read_exact(&mut size_message_buf).await?;
        let size_message = u32::from_be_bytes(size_message_buf);
        if size_message == 0 {
            return Ok(Message::KeepAlive);
        }
        if size_message > MAX_FRAME_LEN {
            bail!(ProtocolError::FrameTooLong(size_message));
        }

        // get type of message
        let mut type_message_buf = [0u8; 1];
        self.read_exact(&mut type_message_buf).await?;

        let mut payload = vec![0; (size_message - 1) as usize];
        self.read_exact(&mut payload).await?;
        Ok(Message::parse(type_message_buf[0], payload)?)
    }

    async fn receive_handshake(&mut self) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        self.read_exact(&mut buf).await?;
        Ok(Handshake::deserialize(&buf)?)
    }
}

const _: () = assert!(BLOCK_SIZE + 13 < MAX_FRAME_LEN);
