use std::path::PathBuf;
use serde_derive::{Deserialize, Serialize};
use sha1::Digest;
use url::Url;
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("piece length is zero")]
    ZeroPieceLength,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

}

type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // Path components, joined to form the file path relative to the torrent root.
    pub path: Vec<String>,

    pub length: u64,

}

// The info dictionary. The raw bencoding is retained because the info-hash
// is defined over the exact bytes, and because peers request them verbatim
// through the metadata extension.
#[derive(Debug, Clone, Deserialize)]
pub struct Info {

    pub name: String,

    // Concatenation of all 20-byte SHA1 piece hashes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Single-file form.
    #[serde(default)]
    pub length: Option<u64>,

    // Multi-file form.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    #[serde(default)]
    pub private: Option<u8>,

    #[serde(skip)]
    raw: Vec<u8>,

    #[serde(skip)]
    hash: ID,

}

// A file's span within the torrent's flat byte space.
#[derive(Debug, Clone)]
pub struct FileSpan {

    pub path: PathBuf,

    pub length: u64,

    // Offset in bytes from the start of the torrent.
    pub offset: u64,

}

impl Info {

    // Parses an info dictionary from its exact bencoding, as produced by a
    // .torrent file or assembled from metadata-extension pieces.
    pub fn from_bytes(raw: &[u8]) -> Result<Info> {

        let mut info: Info = serde_bencode::from_bytes(raw)?;
        if info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if info.piece_length == 0 {
            return Err(MetaInfoError::ZeroPieceLength);
        }

        let mut hasher = sha1::Sha1::new();
        hasher.update(raw);
        info.hash = hasher.finalize().into();
        info.raw = raw.to_vec();
        Ok(info)
    }

    pub fn info_hash(&self) -> ID { self.hash }

    // The exact bencoding this info was parsed from.
    pub fn as_bytes(&self) -> &[u8] { &self.raw }

    pub fn num_pieces(&self) -> u32 { (self.pieces.len() / 20) as u32 }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.length.unwrap_or(0)
        }
    }

    pub fn piece_len(&self, idx: u32) -> usize {
        debug_assert!(idx < self.num_pieces());
        if idx == self.num_pieces() - 1 {
            self.last_piece_len()
        } else {
            self.piece_length as usize
        }
    }

    pub fn last_piece_len(&self) -> usize {
        let rem = (self.total_len() % self.piece_length as u64) as usize;
        if rem == 0 { self.piece_length as usize } else { rem }
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.pieces
            .chunks_exact(20)
            // Length is a multiple of 20, checked in from_bytes.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn file_spans(&self) -> Vec<FileSpan> {
        if let Some(files) = &self.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let span = FileSpan {
                    path: f.path.iter().collect(),
                    length: f.length,
                    offset,
                };
                offset += f.length;
                span
            }).collect()
        } else {
            vec![FileSpan {
                path: self.name.clone().into(),
                length: self.length.unwrap_or(0),
                offset: 0,
            }]
        }
    }
}

// Raw .torrent shape. The info dict is held as an opaque value so it can be
// re-encoded byte-for-byte for hashing.
#[derive(Deserialize)]
struct RawMetaInfo {

    #[serde(default)]
    announce: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,

    // BEP 19 webseed urls.
    #[serde(default)]
    #[serde(rename = "url-list")]
    url_list: Option<Vec<String>>,

    info: serde_bencode::value::Value,

}

#[derive(Debug, Clone)]
pub struct MetaInfo {

    pub info: Info,

    // Tracker tiers in announce order (BEP 12).
    pub trackers: Vec<Vec<Url>>,

    pub webseeds: Vec<Url>,

}

impl MetaInfo {

    pub fn from_bytes(buf: &[u8]) -> Result<MetaInfo> {

        let raw: RawMetaInfo = serde_bencode::from_bytes(buf)?;
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let info = Info::from_bytes(&info_bytes)?;

        let mut trackers = Vec::new();
        if let Some(announce_list) = raw.announce_list {
            for tier in announce_list {
                let tier: Vec<Url> = tier
                    .iter()
                    .filter_map(|s| Url::parse(s).ok())
                    .collect();
                if !tier.is_empty() {
                    trackers.push(tier);
                }
            }
        }
        if trackers.is_empty() {
            if let Some(announce) = &raw.announce {
                let url = Url::parse(announce)
                    .map_err(|_| MetaInfoError::InvalidUrl(announce.clone()))?;
                trackers.push(vec![url]);
            }
        }

        let webseeds = raw.url_list
            .unwrap_or_default()
            .iter()
            .filter_map(|s| Url::parse(s).ok())
            .collect();

        Ok(MetaInfo { info, trackers, webseeds })
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        MetaInfo::from_bytes(&std::fs::read(path)?)
    }

    pub fn info_hash(&self) -> ID { self.info.info_hash() }

    // Trackers flattened out of their tiers, announce order preserved.
    pub fn tracker_urls(&self) -> Vec<Url> {
        self.trackers.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hand-rolled single-file torrent: two pieces of 32 KiB, 40 KiB total.
    fn test_torrent() -> Vec<u8> {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[0xaa; 20]);
        pieces.extend_from_slice(&[0xbb; 20]);

        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi40960e4:name8:test.bin12:piece lengthi32768e6:pieces40:");
        info.extend_from_slice(&pieces);
        info.push(b'e');

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce26:http://tracker.example/ann8:url-listl26:http://seed.example/files/e4:info");
        buf.extend_from_slice(&info);
        buf.push(b'e');
        buf
    }

    #[test]
    fn test_parse() {
        let metainfo = MetaInfo::from_bytes(&test_torrent()).unwrap();
        assert_eq!(metainfo.info.num_pieces(), 2);
        assert_eq!(metainfo.info.total_len(), 40_960);
        assert_eq!(metainfo.info.piece_len(0), 32_768);
        assert_eq!(metainfo.info.piece_len(1), 8_192);
        assert_eq!(metainfo.info.piece_hashes()[1], [0xbb; 20]);
        assert_eq!(metainfo.tracker_urls().len(), 1);
        assert_eq!(metainfo.webseeds.len(), 1);
    }

    #[test]
    fn test_info_hash_is_over_exact_bytes() {
        let buf = test_torrent();
        let metainfo = MetaInfo::from_bytes(&buf).unwrap();

        // The hash must match a digest of the info substring of the file.
        let start = buf.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let info_raw = &buf[start..buf.len() - 1];
        let mut hasher = sha1::Sha1::new();
        hasher.update(info_raw);
        let expected: ID = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
    }

    #[test]
    fn test_round_trip_through_raw_bytes() {
        let metainfo = MetaInfo::from_bytes(&test_torrent()).unwrap();
        let again = Info::from_bytes(metainfo.info.as_bytes()).unwrap();
        assert_eq!(again.info_hash(), metainfo.info_hash());
    }

    #[test]
    fn test_last_piece_aligned() {
        // Total length an exact multiple of the piece length.
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[0x11; 20]);
        let mut info = Vec::new();
        info.extend_from_slice(b"d6:lengthi32768e4:name1:a12:piece lengthi32768e6:pieces20:");
        info.extend_from_slice(&pieces);
        info.push(b'e');
        let parsed = Info::from_bytes(&info).unwrap();
        assert_eq!(parsed.last_piece_len(), 32_768);
    }
}
