//! The framing codecs of the BitTorrent wire protocol: the fixed 68 byte
//! handshake, and the length-prefixed message stream spoken after it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::PeerError, Bitfield, BlockInfo, PeerId, PieceIndex, BLOCK_LEN,
};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// An upper bound on the length prefix of a single message. The largest
/// legitimate messages are piece blocks (16 KiB plus header), bitfields of
/// huge torrents, and metadata exchange pieces; anything beyond this is
/// a protocol violation.
const MAX_MESSAGE_LEN: u32 = 2 * 1024 * 1024;

// Reserved field bits (BEP 3 reserved bytes, indexed 0..8 from the left).
const EXTENSION_PROTOCOL_BYTE: usize = 5;
const EXTENSION_PROTOCOL_MASK: u8 = 0x10;
const DHT_BYTE: usize = 7;
const DHT_MASK: u8 = 0x01;
const FAST_BYTE: usize = 7;
const FAST_MASK: u8 = 0x04;
const V2_UPGRADE_BYTE: usize = 7;
const V2_UPGRADE_MASK: u8 = 0x10;

/// The fixed 68 byte BitTorrent handshake.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always "BitTorrent protocol".
    pub prot: [u8; 19],
    /// Eight reserved bytes whose bits advertise protocol extensions.
    pub reserved: [u8; 8],
    /// The 20 byte wire form of the torrent's info hash.
    pub info_hash: [u8; 20],
    /// The arbitrary 20 byte peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake. We advertise the extension
    /// protocol (BEP 10), which the metadata exchange rides on.
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_MASK;
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_MASK != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_BYTE] & DHT_MASK != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_BYTE] & FAST_MASK != 0
    }

    pub fn supports_v2(&self) -> bool {
        self.reserved[V2_UPGRADE_BYTE] & V2_UPGRADE_MASK != 0
    }
}

/// The codec of the 68 byte handshake exchanged directly after the TCP
/// connection is made.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(68);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the first byte is the length of the protocol string and must be
        // 19 for every version of the protocol we speak
        if buf[0] != 19 {
            return Err(PeerError::InvalidHandshake);
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(PeerError::InvalidHandshake);
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, as sent on the wire after the length prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl MessageId {
    fn try_from(id: u8) -> Result<Self, PeerError> {
        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            9 => Ok(Self::Port),
            20 => Ok(Self::Extended),
            _ => Err(PeerError::InvalidMessage),
        }
    }
}

/// A message of the peer wire protocol, after the handshake.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// BEP 5: the port of the peer's DHT node.
    Port(u16),
    /// BEP 10: an extension protocol message; `id` 0 is the extension
    /// handshake, other ids are whatever the handshakes negotiated.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the id of the message, or `None` for a keep alive, which has
    /// no id on the wire.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}

/// The codec of the length-prefixed message stream: a 4 byte big endian
/// length prefix, a 1 byte message id, and the body.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                // the variants here all have an id
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bytes);
            }
            Message::Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(id);
                buf.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        // peek at the length prefix without consuming it, as the whole
        // frame may not have arrived yet
        let mut prefix = [0; 4];
        prefix.copy_from_slice(&buf[..4]);
        let msg_len = u32::from_be_bytes(prefix);

        if msg_len > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(msg_len));
        }
        if (buf.len() as u32) < 4 + msg_len {
            // reserve so that repeated reads grow the buffer at most once
            buf.reserve(4 + msg_len as usize - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let body_len = msg_len - 1;

        let msg = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => {
                if body_len != 0 {
                    return Err(PeerError::InvalidMessage);
                }
                match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            MessageId::Have => {
                if body_len != 4 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Have {
                    piece_index: buf.get_u32() as PieceIndex,
                }
            }
            MessageId::Bitfield => {
                let mut bytes = vec![0; body_len as usize];
                buf.copy_to_slice(&mut bytes);
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            MessageId::Request | MessageId::Cancel => {
                if body_len != 12 {
                    return Err(PeerError::InvalidMessage);
                }
                let block = BlockInfo {
                    piece_index: buf.get_u32() as PieceIndex,
                    offset: buf.get_u32(),
                    len: buf.get_u32(),
                };
                // the request granularity ceiling is part of the protocol
                if block.len == 0 || block.len > BLOCK_LEN {
                    return Err(PeerError::InvalidMessage);
                }
                if id == MessageId::Request {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            MessageId::Block => {
                if body_len < 8 {
                    return Err(PeerError::InvalidMessage);
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; (body_len - 8) as usize];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Port => {
                if body_len != 2 {
                    return Err(PeerError::InvalidMessage);
                }
                Message::Port(buf.get_u16())
            }
            MessageId::Extended => {
                if body_len < 1 {
                    return Err(PeerError::InvalidMessage);
                }
                let id = buf.get_u8();
                let mut payload = vec![0; (body_len - 1) as usize];
                buf.copy_to_slice(&mut payload);
                Message::Extended { id, payload }
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut PeerCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0x21; 20], *b"-rp0100-012345678901");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.supports_extension_protocol());
        assert!(!decoded.supports_dht());
        assert!(!decoded.supports_fast());
    }

    #[test]
    fn test_handshake_rejects_wrong_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent protocoX");
        buf.put_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u8(18);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_partial_input() {
        let handshake = Handshake::new([0x21; 20], [1; 20]);
        let mut full = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..40]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[40..]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_message_frames_arrive_fragmented() {
        let block = BlockInfo {
            piece_index: 3,
            offset: BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let msgs = vec![
            Message::KeepAlive,
            Message::Unchoke,
            Message::Have { piece_index: 42 },
            Message::Request(block),
            Message::Block {
                piece_index: 3,
                offset: BLOCK_LEN,
                data: vec![0xfe; 1234],
            },
            Message::Cancel(block),
            Message::Port(6881),
            Message::Extended {
                id: 0,
                payload: b"d1:md11:ut_metadatai3eee".to_vec(),
            },
        ];
        let mut wire = BytesMut::new();
        for msg in msgs.clone() {
            PeerCodec.encode(msg, &mut wire).unwrap();
        }

        // feed the stream one byte at a time: every frame must come out
        // whole and in order
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            buf.extend_from_slice(&[*byte]);
            decoded.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn test_bitfield_round_trip() {
        let mut bitfield = Bitfield::repeat(false, 16);
        bitfield.set(0, true);
        bitfield.set(9, true);

        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Bitfield(bitfield), &mut buf).unwrap();
        // 4 byte prefix + id + 2 bytes of bits
        assert_eq!(buf.len(), 4 + 1 + 2);

        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => {
                assert!(decoded[0]);
                assert!(decoded[9]);
                assert_eq!(decoded.count_ones(), 2);
            }
            msg => panic!("unexpected message: {:?}", msg),
        }
    }

    #[test]
    fn test_oversized_and_invalid_messages_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_LEN + 1);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(PeerError::MessageTooLarge(_))
        ));

        // an unknown message id
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(17);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(PeerError::InvalidMessage)
        ));

        // a request exceeding the block length ceiling
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(BLOCK_LEN * 2);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(PeerError::InvalidMessage)
        ));
    }
}
