use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block::{BlockData, BlockInfo}, Bitfield, MAX_FRAME_LEN};
use super::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Advises the peer not to close the connection, even if it hasn't
    // received anything in some time.
    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // We intend to request blocks from the peer.
    Interested,

    // We no longer intend to request blocks.
    NotInterested,

    // The sender has the piece with this index.
    Have { idx: u32 },

    // Full piece availability, usually sent directly after the handshake.
    Bitfield(Bitfield),

    // Ask for a block: piece index, offset within the piece, length.
    Request(BlockInfo),

    // A block of piece data.
    Block(BlockData),

    // Withdraw an earlier request.
    Cancel(BlockInfo),

    // DHT listen port; accepted and otherwise ignored.
    Port { port: u16 },
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bytes);
            },

            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            // <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.extend_from_slice(&block.data);
            },

            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            // <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Can't read message length.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_len = peeker.get_u32() as usize;

        // Bound memory before waiting for the rest of the frame.
        if msg_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(msg_len));
        }

        if src.remaining() < 4 + msg_len {
            // Haven't recieved all of the message.
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let msg = match (id, msg_len) {
            (0, 1) => Message::Choke,
            (1, 1) => Message::Unchoke,
            (2, 1) => Message::Interested,
            (3, 1) => Message::NotInterested,
            (4, 5) => Message::Have { idx: src.get_u32() },
            (5, _) => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            (6, 13) => Message::Request(BlockInfo {
                piece_idx: src.get_u32(),
                offset: src.get_u32(),
                len: src.get_u32(),
            }),
            (7, n) if n >= 9 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(BlockData { piece_idx, offset, data })
            },
            (8, 13) => Message::Cancel(BlockInfo {
                piece_idx: src.get_u32(),
                offset: src.get_u32(),
                len: src.get_u32(),
            }),
            (9, 3) => Message::Port { port: src.get_u16() },
            (id @ 0..=9, _) => {
                tracing::warn!("message id {} with bad payload length {}", id, msg_len - 1);
                return Err(PeerError::InvalidMessage);
            },
            (id, _) => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
        }
    }
}
