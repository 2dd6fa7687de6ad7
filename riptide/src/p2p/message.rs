use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block::{BlockData, BlockInfo}, Bitfield};
use super::PeerError;

// Core message set plus the fast extension (BEP 6) and the extension
// protocol envelope (BEP 10). Framing is 4-byte big-endian length, 1-byte
// id, payload.
#[cfg_attr(test, derive(Clone, PartialEq, Eq))]
#[derive(Debug)]
pub enum Message {

    KeepAlive,

    Choke,

    Unchoke,

    Interested,

    NotInterested,

    Have { idx: u32 },

    // Sent once, directly after the handshake.
    Bitfield(Bitfield),

    Request(BlockInfo),

    Block(BlockData),

    Cancel(BlockInfo),

    // DHT listen port.
    Port { port: u16 },

    // Fast extension.
    SuggestPiece { idx: u32 },

    HaveAll,

    HaveNone,

    RejectRequest(BlockInfo),

    AllowedFast { idx: u32 },

    // Extension protocol envelope. The id selects the negotiated extension;
    // 0 is the extended handshake.
    Extended { id: u8, payload: Vec<u8> },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            Message::KeepAlive => dst.put_u32(0),

            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(bytes);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            Message::SuggestPiece { idx } => {
                dst.put_u32(5);
                dst.put_u8(13);
                dst.put_u32(idx);
            },

            Message::HaveAll => {
                dst.put_u32(1);
                dst.put_u8(14);
            },

            Message::HaveNone => {
                dst.put_u32(1);
                dst.put_u8(15);
            },

            Message::RejectRequest(block) => {
                dst.put_u32(13);
                dst.put_u8(16);
                dst.put_u32(block.piece_idx);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            },

            Message::AllowedFast { idx } => {
                dst.put_u32(5);
                dst.put_u8(17);
                dst.put_u32(idx);
            },

            // extended: <len=0002+X><id=20><ext id><payload>
            Message::Extended { id, payload } => {
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
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
        if src.remaining() < 4 { return Ok(None); }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len = peeker.get_u32() as usize;

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }
        } else {
            // Haven't received the full message yet.
            return Ok(None);
        }

        let msg = match src.get_u8() {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut bitfield = vec![0; msg_len - 1];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Request(BlockInfo { piece_idx, offset, len })
            },
            7 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let mut data = vec![0; msg_len - 9];
                src.copy_to_slice(&mut data);
                Message::Block(BlockData { piece_idx, offset, data })
            },
            8 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::Cancel(BlockInfo { piece_idx, offset, len })
            },
            9 => Message::Port { port: src.get_u16() },
            13 => Message::SuggestPiece { idx: src.get_u32() },
            14 => Message::HaveAll,
            15 => Message::HaveNone,
            16 => {
                let piece_idx = src.get_u32();
                let offset = src.get_u32();
                let len = src.get_u32();
                Message::RejectRequest(BlockInfo { piece_idx, offset, len })
            },
            17 => Message::AllowedFast { idx: src.get_u32() },
            20 => {
                let id = src.get_u8();
                let mut payload = vec![0; msg_len - 2];
                src.copy_to_slice(&mut payload);
                Message::Extended { id, payload }
            },
            id => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            }
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
            Message::Have { idx } => write!(f, "have {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(b) => write!(f, "request {{ piece: {}, offset: {}, len: {} }}", b.piece_idx, b.offset, b.len),
            Message::Block(b) => write!(f, "block {{ piece: {}, offset: {}, len: {} }}", b.piece_idx, b.offset, b.data.len()),
            Message::Cancel(b) => write!(f, "cancel {{ piece: {}, offset: {}, len: {} }}", b.piece_idx, b.offset, b.len),
            Message::Port { port } => write!(f, "port {}", port),
            Message::SuggestPiece { idx } => write!(f, "suggest {}", idx),
            Message::HaveAll => write!(f, "have all"),
            Message::HaveNone => write!(f, "have none"),
            Message::RejectRequest(b) => write!(f, "reject {{ piece: {}, offset: {}, len: {} }}", b.piece_idx, b.offset, b.len),
            Message::AllowedFast { idx } => write!(f, "allowed fast {}", idx),
            Message::Extended { id, payload } => write!(f, "extended {{ id: {}, len: {} }}", id, payload.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn test_msg_stream() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Have all
        buf.extend_from_slice(&[0, 0, 0, 1, 14]);
        // Allowed fast
        buf.extend_from_slice(&[0, 0, 0, 5, 17, 0, 0, 0, 0x2]);
        // Extended handshake envelope
        buf.extend_from_slice(&[0, 0, 0, 4, 20, 0, b'd', b'e']);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::Have { idx: 0xb },
            Message::Bitfield(BitVec::<u8, Msb0>::from_slice(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
            Message::HaveAll,
            Message::AllowedFast { idx: 2 },
            Message::Extended { id: 0, payload: b"de".to_vec() },
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap().unwrap(), Message::Interested);

        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&[0x2, 0x3]);
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Block(BlockData { piece_idx: 0xb, offset: 0x134000, data: vec![0x1, 0x2, 0x3] }),
        );
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        match MessageCodec.decode(&mut src) {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            other => panic!("expected invalid message id error, got {:?}", other.map(|m| m.map(|m| m.to_string()))),
        }
    }

    #[test]
    fn test_port_round_trip() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Port { port: 6881 }, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, 9, 0x1a, 0xe1]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap().unwrap(), Message::Port { port: 6881 });
    }
}
