//! Parsing of `.torrent` metainfo files and of the `info` dictionaries
//! received through the metadata exchange.
//!
//! The info hash is always computed over the exact bencoded bytes of the
//! `info` dictionary as they appear in the source buffer, never over a
//! re-encoding, since a round trip through typed structs would drop unknown
//! keys and change the hash.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;

use crate::{InfoHash, Sha1Hash, Sha256Hash};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("invalid bencoding: {0}")]
    Bencode(String),
    #[error("metainfo has no info dictionary")]
    NoInfoDict,
    #[error("metainfo has neither v1 pieces nor a v2 file tree")]
    NoPieceHashes,
    #[error("piece hash string length is not a multiple of the digest size")]
    InvalidPieceHashes,
    #[error("piece length is not a power of two")]
    InvalidPieceLength,
    #[error("torrent has no files")]
    NoFiles,
    #[error("file path is not filesystem safe: {0:?}")]
    UnsafeFilePath(String),
    #[error("v2 piece layers are missing or inconsistent")]
    InvalidPieceLayers,
    #[error("multi-file v2-only torrents are not supported")]
    UnsupportedV2MultiFile,
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e.to_string())
    }
}

/// The per-piece hash backend of a torrent.
#[derive(Clone, Debug)]
pub enum PieceHashes {
    /// v1: the concatenation of 20 byte SHA-1 digests, one per piece.
    Sha1(Vec<u8>),
    /// v2 (BEP 52): one 32 byte piece-layer root per piece.
    Sha256(Vec<Sha256Hash>),
}

impl PieceHashes {
    pub fn piece_count(&self) -> usize {
        match self {
            Self::Sha1(bytes) => bytes.len() / 20,
            Self::Sha256(hashes) => hashes.len(),
        }
    }
}

/// A file declared by the torrent, in torrent order.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    /// The sanitized path of the file, relative to the torrent's root.
    pub path: PathBuf,
    pub len: u64,
    /// Whether the torrent declares the file executable (BEP 47 `attr`).
    pub executable: bool,
}

/// The parsed, validated metadata of a torrent.
#[derive(Clone, Debug)]
pub struct Metainfo {
    pub name: String,
    /// The torrent's primary identity: v1 hash for v1 and hybrid torrents,
    /// v2 hash for v2-only torrents.
    pub info_hash: InfoHash,
    /// For hybrid torrents, the v2 hash next to the primary v1 identity.
    pub info_hash_v2: Option<Sha256Hash>,
    pub piece_len: u32,
    pub piece_hashes: PieceHashes,
    pub files: Vec<FileEntry>,
    /// BEP 27: a private torrent must not use DHT or PEX peer discovery.
    pub private: bool,
    pub trackers: Vec<String>,
    /// The exact bencoded bytes of the `info` dictionary, kept for serving
    /// the metadata exchange.
    pub info_bytes: Vec<u8>,
}

impl Metainfo {
    /// Parses a whole `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let info_bytes = info_dict_bytes(buf)?;

        let mut trackers = Vec::new();
        if let Some(tiers) = raw.announce_list {
            for tier in tiers {
                for url in tier {
                    if !trackers.contains(&url) {
                        trackers.push(url);
                    }
                }
            }
        }
        if let Some(announce) = raw.announce {
            if !trackers.contains(&announce) {
                trackers.insert(0, announce);
            }
        }

        Self::from_info_bytes(&info_bytes, trackers, raw.piece_layers)
    }

    /// Parses a bare `info` dictionary, as assembled by the metadata
    /// exchange. v2 torrents cannot be bootstrapped this way as their piece
    /// layers live outside the `info` dictionary, so this path only produces
    /// the SHA-1 backend.
    pub fn from_info_dict(
        info_bytes: &[u8],
        trackers: Vec<String>,
    ) -> Result<Self, MetainfoError> {
        Self::from_info_bytes(info_bytes, trackers, None)
    }

    fn from_info_bytes(
        info_bytes: &[u8],
        trackers: Vec<String>,
        piece_layers: Option<HashMap<ByteBuf, ByteBuf>>,
    ) -> Result<Self, MetainfoError> {
        let info: RawInfo = serde_bencode::from_bytes(info_bytes)?;

        if !info.piece_length.is_power_of_two() {
            return Err(MetainfoError::InvalidPieceLength);
        }

        let files = info.file_entries()?;
        if files.is_empty() {
            return Err(MetainfoError::NoFiles);
        }
        let total_len: u64 = files.iter().map(|f| f.len).sum();

        let v1_pieces = info.pieces.as_ref().map(|p| p.to_vec());
        if let Some(pieces) = &v1_pieces {
            if pieces.len() % 20 != 0 {
                return Err(MetainfoError::InvalidPieceHashes);
            }
        }
        let is_v2 = info.meta_version == Some(2) && info.file_tree.is_some();

        let v1_hash: Sha1Hash = Sha1::digest(info_bytes).into();
        let v2_hash: Sha256Hash = Sha256::digest(info_bytes).into();

        let (info_hash, info_hash_v2, piece_hashes) = match (&v1_pieces, is_v2)
        {
            // v1 only
            (Some(pieces), false) => {
                (InfoHash::V1(v1_hash), None, PieceHashes::Sha1(pieces.clone()))
            }
            // hybrid: v1 identity is primary, v1 hashes are authoritative
            (Some(pieces), true) => (
                InfoHash::V1(v1_hash),
                Some(v2_hash),
                PieceHashes::Sha1(pieces.clone()),
            ),
            // v2 only
            (None, true) => {
                let layers = v2_piece_layers(
                    &info,
                    &files,
                    total_len,
                    piece_layers.as_ref(),
                )?;
                (InfoHash::V2(v2_hash), None, PieceHashes::Sha256(layers))
            }
            (None, false) => return Err(MetainfoError::NoPieceHashes),
        };

        // the hash count must cover the content exactly
        let piece_count = piece_hashes.piece_count();
        let expected =
            (total_len + info.piece_length as u64 - 1) / info.piece_length as u64;
        if piece_count as u64 != expected {
            return Err(MetainfoError::InvalidPieceHashes);
        }

        Ok(Self {
            name: info.name,
            info_hash,
            info_hash_v2,
            piece_len: info.piece_length,
            piece_hashes,
            files,
            private: info.private == Some(1),
            trackers,
            info_bytes: info_bytes.to_vec(),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.piece_count()
    }

    pub fn total_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    pub fn is_archive(&self) -> bool {
        self.files.len() > 1
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "piece layers")]
    piece_layers: Option<HashMap<ByteBuf, ByteBuf>>,
    // the info dictionary is re-extracted from the raw buffer; this field
    // only asserts its presence
    info: serde_bencode::value::Value,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(default)]
    pieces: Option<ByteBuf>,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
    #[serde(rename = "meta version")]
    meta_version: Option<u32>,
    #[serde(rename = "file tree")]
    file_tree: Option<serde_bencode::value::Value>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
    attr: Option<ByteBuf>,
}

impl RawInfo {
    fn file_entries(&self) -> Result<Vec<FileEntry>, MetainfoError> {
        if let Some(files) = &self.files {
            // v1 multi-file
            files
                .iter()
                .map(|f| {
                    Ok(FileEntry {
                        path: sanitize_path(&f.path)?,
                        len: f.length,
                        executable: f
                            .attr
                            .as_ref()
                            .map(|a| a.contains(&b'x'))
                            .unwrap_or(false),
                    })
                })
                .collect()
        } else if let Some(len) = self.length {
            // v1 single file, named after the torrent
            Ok(vec![FileEntry {
                path: sanitize_path(std::slice::from_ref(&self.name))?,
                len,
                executable: false,
            }])
        } else if let Some(tree) = &self.file_tree {
            file_tree_entries(tree)
        } else {
            Err(MetainfoError::NoFiles)
        }
    }
}

/// Flattens a BEP 52 file tree into file entries in tree order.
fn file_tree_entries(
    tree: &serde_bencode::value::Value,
) -> Result<Vec<FileEntry>, MetainfoError> {
    use serde_bencode::value::Value;

    fn walk(
        node: &Value,
        components: &mut Vec<String>,
        out: &mut Vec<FileEntry>,
    ) -> Result<(), MetainfoError> {
        let dict = match node {
            Value::Dict(dict) => dict,
            _ => return Err(MetainfoError::Bencode("file tree node".into())),
        };
        // a leaf is a dict with a single empty key mapping to the file attrs
        if let Some(Value::Dict(attrs)) = dict.get(&b""[..].to_vec()) {
            let len = match attrs.get(&b"length"[..].to_vec()) {
                Some(Value::Int(len)) if *len >= 0 => *len as u64,
                _ => return Err(MetainfoError::Bencode("file length".into())),
            };
            let executable = matches!(
                attrs.get(&b"attr"[..].to_vec()),
                Some(Value::Bytes(attr)) if attr.contains(&b'x')
            );
            out.push(FileEntry {
                path: sanitize_path(components)?,
                len,
                executable,
            });
            return Ok(());
        }
        let mut names: Vec<&Vec<u8>> = dict.keys().collect();
        names.sort();
        for name in names {
            let component = String::from_utf8_lossy(name).into_owned();
            components.push(component);
            walk(&dict[name], components, out)?;
            components.pop();
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(tree, &mut Vec::new(), &mut out)?;
    Ok(out)
}

/// Builds the per-piece SHA-256 hash list of a v2 torrent from its file
/// tree and piece layers.
fn v2_piece_layers(
    info: &RawInfo,
    files: &[FileEntry],
    total_len: u64,
    piece_layers: Option<&HashMap<ByteBuf, ByteBuf>>,
) -> Result<Vec<Sha256Hash>, MetainfoError> {
    use serde_bencode::value::Value;

    // in v2 every file starts on a piece boundary; a uniform contiguous
    // layout only holds for a single file, which is the supported shape
    // (multi-file v2 content is expected to arrive as a hybrid torrent and
    // verify through the v1 branch)
    if files.len() != 1 {
        return Err(MetainfoError::UnsupportedV2MultiFile);
    }

    // find the single file's pieces root in the file tree
    fn find_root(node: &Value) -> Option<Vec<u8>> {
        let dict = match node {
            Value::Dict(dict) => dict,
            _ => return None,
        };
        if let Some(Value::Dict(attrs)) = dict.get(&b""[..].to_vec()) {
            if let Some(Value::Bytes(root)) =
                attrs.get(&b"pieces root"[..].to_vec())
            {
                return Some(root.clone());
            }
            return None;
        }
        dict.values().find_map(find_root)
    }

    let tree = info.file_tree.as_ref().ok_or(MetainfoError::NoPieceHashes)?;
    let root = find_root(tree).ok_or(MetainfoError::InvalidPieceLayers)?;
    if root.len() != 32 {
        return Err(MetainfoError::InvalidPieceLayers);
    }

    let piece_count =
        ((total_len + info.piece_length as u64 - 1) / info.piece_length as u64)
            as usize;

    if piece_count <= 1 {
        // a file no longer than one piece has no layer entry: the pieces
        // root is the piece hash itself
        let mut hash = [0; 32];
        hash.copy_from_slice(&root);
        return Ok(vec![hash]);
    }

    let layer = piece_layers
        .and_then(|layers| {
            layers
                .iter()
                .find(|(key, _)| key.as_slice() == root.as_slice())
                .map(|(_, layer)| layer)
        })
        .ok_or(MetainfoError::InvalidPieceLayers)?;
    if layer.len() != piece_count * 32 {
        return Err(MetainfoError::InvalidPieceLayers);
    }
    Ok(layer
        .chunks_exact(32)
        .map(|chunk| {
            let mut hash = [0; 32];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Joins path components into a relative path, refusing traversal
/// components, absolute paths and separators inside components.
pub(crate) fn sanitize_path<S: AsRef<str>>(
    components: &[S],
) -> Result<PathBuf, MetainfoError> {
    let mut path = PathBuf::new();
    for component in components {
        let component = component.as_ref();
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0')
        {
            return Err(MetainfoError::UnsafeFilePath(component.into()));
        }
        path.push(component);
    }
    if path.as_os_str().is_empty() {
        return Err(MetainfoError::UnsafeFilePath(String::new()));
    }
    Ok(path)
}

/// Returns the exact byte range of the `info` dictionary's value within
/// a bencoded metainfo buffer.
fn info_dict_bytes(buf: &[u8]) -> Result<Vec<u8>, MetainfoError> {
    // the top level value must be a dict
    if buf.first() != Some(&b'd') {
        return Err(MetainfoError::Bencode("expected top level dict".into()));
    }
    let mut pos = 1;
    while pos < buf.len() && buf[pos] != b'e' {
        let key_len = bencode_value_len(&buf[pos..])?;
        let key = &buf[pos..pos + key_len];
        pos += key_len;
        let value_len = bencode_value_len(&buf[pos..])?;
        if key == b"4:info" {
            return Ok(buf[pos..pos + value_len].to_vec());
        }
        pos += value_len;
    }
    Err(MetainfoError::NoInfoDict)
}

/// Returns the encoded length of the first bencode value in the buffer.
///
/// Also used by the peer layer to split the bencoded header of a
/// `ut_metadata` message from the raw piece data that follows it.
pub(crate) fn bencode_value_len(buf: &[u8]) -> Result<usize, MetainfoError> {
    fn inner(buf: &[u8], pos: usize) -> Result<usize, MetainfoError> {
        let err = || MetainfoError::Bencode("truncated value".into());
        match buf.get(pos).ok_or_else(err)? {
            b'i' => {
                let end = buf[pos..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(err)?;
                Ok(pos + end + 1)
            }
            b'l' | b'd' => {
                let mut pos = pos + 1;
                while *buf.get(pos).ok_or_else(err)? != b'e' {
                    pos = inner(buf, pos)?;
                }
                Ok(pos + 1)
            }
            b'0'..=b'9' => {
                let colon = buf[pos..]
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(err)?;
                let len: usize = std::str::from_utf8(&buf[pos..pos + colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        MetainfoError::Bencode("invalid string length".into())
                    })?;
                let end = pos + colon + 1 + len;
                if end > buf.len() {
                    return Err(err());
                }
                Ok(end)
            }
            _ => Err(MetainfoError::Bencode("unknown value type".into())),
        }
    }
    inner(buf, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // A tiny single file torrent: two 16 KiB pieces worth of hashes over a
    // 20 KiB file.
    fn single_file_torrent() -> Vec<u8> {
        let piece_hashes = vec![0x11u8; 40];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce19:http://tracker/test4:info");
        buf.extend_from_slice(b"d6:lengthi20480e4:name8:test.bin12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&piece_hashes);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn test_parse_single_file() {
        let buf = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_len, 16384);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.total_len(), 20480);
        assert_eq!(metainfo.files.len(), 1);
        assert_eq!(metainfo.files[0].path, PathBuf::from("test.bin"));
        assert!(!metainfo.private);
        assert_eq!(metainfo.trackers, vec!["http://tracker/test".to_string()]);
        assert!(matches!(metainfo.info_hash, InfoHash::V1(_)));
    }

    #[test]
    fn test_info_hash_covers_exact_info_bytes() {
        let buf = single_file_torrent();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        // the extracted info slice must re-hash to the computed info hash
        let digest: [u8; 20] = Sha1::digest(&metainfo.info_bytes).into();
        assert_eq!(metainfo.info_hash, InfoHash::V1(digest));
        // and reparsing the info slice alone yields the same metadata
        let reparsed =
            Metainfo::from_info_dict(&metainfo.info_bytes, Vec::new()).unwrap();
        assert_eq!(reparsed.info_hash, metainfo.info_hash);
        assert_eq!(reparsed.piece_len, metainfo.piece_len);
        assert_eq!(reparsed.files, metainfo.files);
    }

    #[test]
    fn test_piece_hash_count_must_match_length() {
        // one 20 byte hash for a two piece file
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:info");
        buf.extend_from_slice(b"d6:lengthi20480e4:name1:x12:piece lengthi16384e6:pieces20:");
        buf.extend_from_slice(&[0u8; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(MetainfoError::InvalidPieceHashes)
        ));
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(
            sanitize_path(&["a", "b.txt"]).unwrap(),
            PathBuf::from("a/b.txt")
        );
        assert!(sanitize_path(&[".."]).is_err());
        assert!(sanitize_path(&["a/../b"]).is_err());
        assert!(sanitize_path(&["a\\b"]).is_err());
        assert!(sanitize_path(&[""]).is_err());
        let empty: [&str; 0] = [];
        assert!(sanitize_path(&empty).is_err());
    }

    #[test]
    fn test_bencode_value_len() {
        assert_eq!(bencode_value_len(b"i42e").unwrap(), 4);
        assert_eq!(bencode_value_len(b"4:spam").unwrap(), 6);
        assert_eq!(bencode_value_len(b"l4:spami42ee").unwrap(), 12);
        assert_eq!(bencode_value_len(b"d3:cow3:mooe").unwrap(), 12);
        // trailing bytes are not part of the value
        assert_eq!(bencode_value_len(b"i42eXYZ").unwrap(), 4);
        assert!(bencode_value_len(b"i42").is_err());
        assert!(bencode_value_len(b"9:ab").is_err());
        assert!(bencode_value_len(b"x").is_err());
    }
}
