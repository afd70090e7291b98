use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

pub const HANDSHAKE_LEN: usize = 68;

// Extension support advertised in the reserved bytes. Recorded for
// introspection only, nothing here depends on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extensions {
    // BEP 5, reserved[7] & 0x01.
    pub dht: bool,

    // BEP 6, reserved[7] & 0x04.
    pub fast: bool,

    // BEP 10, reserved[5] & 0x10.
    pub extension_protocol: bool,
}

pub struct Handshake {
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: ID,
    pub peer_id: ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self {
            protocol: PROTOCOL,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn extensions(&self) -> Extensions {
        Extensions {
            dht: self.reserved[7] & 0x01 != 0,
            fast: self.reserved[7] & 0x04 != 0,
            extension_protocol: self.reserved[5] & 0x10 != 0,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len(), HANDSHAKE_LEN, "encoded handshake length is not 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::IncorrectProtocol);
        }

        if src.remaining() < HANDSHAKE_LEN {
            // Handshake not fully recieved.
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}
