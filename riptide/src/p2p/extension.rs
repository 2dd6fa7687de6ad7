use std::collections::HashMap;
use serde_derive::{Deserialize, Serialize};
use super::PeerError;

// Extension protocol (BEP 10) and metadata extension (BEP 9) payloads.

pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

// The id we advertise for ut_metadata in our m dictionary.
pub const UT_METADATA_LOCAL_ID: u8 = 1;

// Metadata is transferred in 16 KiB pieces.
pub const METADATA_PIECE_SIZE: usize = 0x4000;

pub const METADATA_REQUEST: u8 = 0;
pub const METADATA_DATA: u8 = 1;
pub const METADATA_REJECT: u8 = 2;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExtendedHandshake {

    // Extension name to message id, e.g. {"ut_metadata": 3}.
    #[serde(default)]
    pub m: HashMap<String, u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,

    // Number of outstanding requests the peer tolerates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,

    // Client name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,

}

impl ExtendedHandshake {

    pub fn ours(metadata_size: Option<u32>) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_metadata".to_string(), UT_METADATA_LOCAL_ID);
        Self {
            m,
            metadata_size,
            v: Some(concat!("riptide ", env!("CARGO_PKG_VERSION")).to_string()),
            reqq: Some(250),
        }
    }

    pub fn ut_metadata(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PeerError> {
        Ok(serde_bencode::from_bytes(buf)?)
    }
}

// ut_metadata header. Data messages carry the raw metadata block after the
// bencoded dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetadataMessage {

    pub msg_type: u8,

    pub piece: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u32>,

}

impl MetadataMessage {

    pub fn request(piece: u32) -> Self {
        Self { msg_type: METADATA_REQUEST, piece, total_size: None }
    }

    pub fn reject(piece: u32) -> Self {
        Self { msg_type: METADATA_REJECT, piece, total_size: None }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    // Encodes a data message: header dictionary followed by the raw block.
    pub fn encode_data(piece: u32, total_size: u32, data: &[u8]) -> Result<Vec<u8>, PeerError> {
        let header = MetadataMessage {
            msg_type: METADATA_DATA,
            piece,
            total_size: Some(total_size),
        };
        let mut buf = serde_bencode::to_bytes(&header)?;
        buf.extend_from_slice(data);
        Ok(buf)
    }

    // Splits a ut_metadata payload into its header and any trailing block
    // bytes. The header dictionary ends where the top-level dict closes.
    pub fn decode(payload: &[u8]) -> Result<(MetadataMessage, &[u8]), PeerError> {
        let end = dict_end(payload).ok_or(PeerError::InvalidMessage)?;
        let header: MetadataMessage = serde_bencode::from_bytes(&payload[..end])?;
        Ok((header, &payload[end..]))
    }
}

// Returns the length of the bencoded value starting at buf[0], or None if
// the value is malformed or truncated.
fn dict_end(buf: &[u8]) -> Option<usize> {
    fn value_end(buf: &[u8], at: usize) -> Option<usize> {
        match buf.get(at)? {
            b'i' => {
                let close = buf[at..].iter().position(|&b| b == b'e')?;
                Some(at + close + 1)
            },
            b'l' | b'd' => {
                let mut pos = at + 1;
                while *buf.get(pos)? != b'e' {
                    pos = value_end(buf, pos)?;
                }
                Some(pos + 1)
            },
            b'0'..=b'9' => {
                let colon = buf[at..].iter().position(|&b| b == b':')?;
                let len: usize = std::str::from_utf8(&buf[at..at + colon]).ok()?.parse().ok()?;
                let end = at + colon + 1 + len;
                if end > buf.len() { None } else { Some(end) }
            },
            _ => None,
        }
    }
    value_end(buf, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_handshake_round_trip() {
        let ours = ExtendedHandshake::ours(Some(31_334));
        let decoded = ExtendedHandshake::from_bytes(&ours.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.ut_metadata(), Some(UT_METADATA_LOCAL_ID));
        assert_eq!(decoded.metadata_size, Some(31_334));
    }

    #[test]
    fn test_handshake_without_metadata() {
        // A minimal handshake from a peer with no extensions.
        let decoded = ExtendedHandshake::from_bytes(b"de").unwrap();
        assert_eq!(decoded.ut_metadata(), None);
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn test_request_round_trip() {
        let req = MetadataMessage::request(3);
        let buf = req.to_bytes().unwrap();
        let (decoded, rest) = MetadataMessage::decode(&buf).unwrap();
        assert_eq!(decoded, req);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_data_split() {
        let block = vec![0x5a; 1000];
        let buf = MetadataMessage::encode_data(1, 17_384, &block).unwrap();
        let (header, rest) = MetadataMessage::decode(&buf).unwrap();
        assert_eq!(header.msg_type, METADATA_DATA);
        assert_eq!(header.piece, 1);
        assert_eq!(header.total_size, Some(17_384));
        assert_eq!(rest, &block[..]);
    }

    #[test]
    fn test_data_split_with_dict_like_block() {
        // Block bytes that themselves look like bencode must not confuse the
        // header scanner.
        let block = b"d8:msg_typei1ee".to_vec();
        let buf = MetadataMessage::encode_data(0, 15, &block).unwrap();
        let (header, rest) = MetadataMessage::decode(&buf).unwrap();
        assert_eq!(header.piece, 0);
        assert_eq!(rest, &block[..]);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(MetadataMessage::decode(b"d8:msg_typei0e5:piecei").is_err());
    }
}
