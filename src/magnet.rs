//! Magnet URI parsing and generation (BEP 9), including the BEP 53
//! file-selection parameters.
//!
//! A magnet link identifies a torrent by its info hash alone; everything
//! else on the URI is a hint. Accordingly only a missing or undecodable
//! `xt` is a parse error, while malformed `so`/`x.pe` hints merely disable
//! that hint with a warning.

use std::collections::BTreeMap;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;
use url::Url;

use crate::{storage_info::FilePriority, FileIndex, InfoHash};

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("not a magnet URI")]
    NotMagnet,
    #[error("magnet URI missing xt=urn:btih or xt=urn:btmh")]
    MissingInfoHash,
    #[error("magnet info hash is not valid hex or base32: {0:?}")]
    InvalidInfoHash(String),
}

/// Information extracted from a magnet link.
#[derive(Clone, Debug, PartialEq)]
pub struct MagnetInfo {
    pub info_hash: InfoHash,
    /// The display name hint (`dn`).
    pub name: Option<String>,
    /// Tracker URLs (`tr`), in URI order.
    pub trackers: Vec<String>,
    /// BEP 53 `so`: the indices of the files to download. `None` means all.
    pub selected_indices: Option<Vec<FileIndex>>,
    /// BEP 53 `x.pe`: per-file priority overrides.
    pub priorities: Option<Vec<(FileIndex, FilePriority)>>,
}

impl MagnetInfo {
    /// Parses a magnet URI.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let url = Url::parse(uri).map_err(|_| MagnetError::NotMagnet)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::NotMagnet);
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut selected_indices = None;
        let mut priorities = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if info_hash.is_none() {
                        info_hash = Some(parse_xt(&value)?);
                    }
                }
                "dn" => {
                    if name.is_none() {
                        name = Some(value.into_owned());
                    }
                }
                "tr" => trackers.push(value.into_owned()),
                // BEP 53: only the first occurrence of each hint counts
                "so" => {
                    if selected_indices.is_none() {
                        match parse_index_list(&value) {
                            Ok(indices) => selected_indices = Some(indices),
                            Err(e) => log::warn!(
                                "Ignoring invalid magnet 'so' parameter: {}",
                                e
                            ),
                        }
                    }
                }
                "x.pe" => {
                    if priorities.is_none() {
                        match parse_priority_pairs(&value) {
                            Ok(pairs) => priorities = Some(pairs),
                            Err(e) => log::warn!(
                                "Ignoring invalid magnet 'x.pe' parameter: {}",
                                e
                            ),
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            name,
            trackers,
            selected_indices,
            priorities,
        })
    }

    /// Renders the magnet URI, hex-encoded. The inverse of [`parse`]; used
    /// to persist a metadata re-acquisition source in checkpoints.
    ///
    /// [`parse`]: Self::parse
    pub fn to_uri(&self) -> String {
        // everything except the characters URLs treat as structure
        const QUERY: &AsciiSet = &CONTROLS
            .add(b' ')
            .add(b'"')
            .add(b'<')
            .add(b'>')
            .add(b'#')
            .add(b'%')
            .add(b'&')
            .add(b'+');

        let mut uri = match self.info_hash {
            InfoHash::V1(hash) => {
                format!("magnet:?xt=urn:btih:{}", hex::encode(hash))
            }
            InfoHash::V2(hash) => {
                // BEP 52 multihash: sha2-256 (0x12), 32 bytes (0x20)
                format!("magnet:?xt=urn:btmh:1220{}", hex::encode(hash))
            }
        };
        if let Some(name) = &self.name {
            uri.push_str("&dn=");
            uri.extend(utf8_percent_encode(name, QUERY));
        }
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.extend(utf8_percent_encode(tracker, QUERY));
        }
        if let Some(indices) = &self.selected_indices {
            let list: Vec<String> =
                indices.iter().map(|i| i.to_string()).collect();
            uri.push_str("&so=");
            uri.push_str(&list.join(","));
        }
        if let Some(priorities) = &self.priorities {
            let pairs: Vec<String> = priorities
                .iter()
                .map(|(index, priority)| {
                    format!("{}:{}", index, *priority as u8)
                })
                .collect();
            uri.push_str("&x.pe=");
            uri.push_str(&pairs.join(","));
        }
        uri
    }
}

/// Decodes the `xt` parameter: `urn:btih:` followed by 40 hex or 32 base32
/// characters, or `urn:btmh:` followed by a sha2-256 multihash.
fn parse_xt(xt: &str) -> Result<InfoHash, MagnetError> {
    if let Some(btih) = xt.strip_prefix("urn:btih:") {
        let btih = btih.trim();
        let bytes = match btih.len() {
            40 => hex::decode(btih)
                .map_err(|_| MagnetError::InvalidInfoHash(btih.into()))?,
            32 => base32::decode(
                base32::Alphabet::RFC4648 { padding: false },
                &btih.to_uppercase(),
            )
            .ok_or_else(|| MagnetError::InvalidInfoHash(btih.into()))?,
            _ => return Err(MagnetError::InvalidInfoHash(btih.into())),
        };
        if bytes.len() != 20 {
            return Err(MagnetError::InvalidInfoHash(btih.into()));
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&bytes);
        Ok(InfoHash::V1(hash))
    } else if let Some(btmh) = xt.strip_prefix("urn:btmh:") {
        let btmh = btmh.trim();
        // only the sha2-256 multihash prefix is meaningful for torrents
        let hex_part = btmh
            .strip_prefix("1220")
            .ok_or_else(|| MagnetError::InvalidInfoHash(btmh.into()))?;
        let bytes = hex::decode(hex_part)
            .map_err(|_| MagnetError::InvalidInfoHash(btmh.into()))?;
        if bytes.len() != 32 {
            return Err(MagnetError::InvalidInfoHash(btmh.into()));
        }
        let mut hash = [0; 32];
        hash.copy_from_slice(&bytes);
        Ok(InfoHash::V2(hash))
    } else {
        Err(MagnetError::MissingInfoHash)
    }
}

/// Parses a BEP 53 index list: comma separated indices and inclusive
/// ranges, e.g. `0,3-5,8`. Whitespace around tokens is tolerated.
fn parse_index_list(list: &str) -> Result<Vec<FileIndex>, String> {
    let mut indices = std::collections::BTreeSet::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (start, end) = parse_index_range(token)?;
        indices.extend(start..=end);
    }
    Ok(indices.into_iter().collect())
}

/// Parses a BEP 53 priority list: comma separated `index:priority` or
/// `start-end:priority` pairs with priorities 0-4.
fn parse_priority_pairs(
    list: &str,
) -> Result<Vec<(FileIndex, FilePriority)>, String> {
    let mut priorities = BTreeMap::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let sep = token
            .rfind(':')
            .ok_or_else(|| format!("missing ':' in {:?}", token))?;
        let (index_part, priority_part) = token.split_at(sep);
        let priority: u8 = priority_part[1..]
            .trim()
            .parse()
            .map_err(|_| format!("invalid priority in {:?}", token))?;
        let priority = FilePriority::from_level(priority)
            .ok_or_else(|| format!("priority out of range in {:?}", token))?;
        let (start, end) = parse_index_range(index_part.trim())?;
        for index in start..=end {
            priorities.insert(index, priority);
        }
    }
    Ok(priorities.into_iter().collect())
}

/// Parses `index` or `start-end` into an inclusive range.
fn parse_index_range(token: &str) -> Result<(FileIndex, FileIndex), String> {
    if let Some(sep) = token.find('-') {
        let start: FileIndex = token[..sep]
            .trim()
            .parse()
            .map_err(|_| format!("invalid range start in {:?}", token))?;
        let end: FileIndex = token[sep + 1..]
            .trim()
            .parse()
            .map_err(|_| format!("invalid range end in {:?}", token))?;
        if start > end {
            return Err(format!("range start past end in {:?}", token));
        }
        Ok((start, end))
    } else {
        let index: FileIndex = token
            .parse()
            .map_err(|_| format!("invalid index in {:?}", token))?;
        Ok((index, index))
    }
}

/// Drops hinted indices that fall outside `[0, num_files)`. Called when the
/// hints are applied, which can only happen once metadata is known.
pub(crate) fn clamp_indices(
    indices: &[FileIndex],
    num_files: usize,
) -> Vec<FileIndex> {
    let (valid, invalid): (Vec<FileIndex>, Vec<FileIndex>) =
        indices.iter().partition(|&&index| index < num_files);
    if !invalid.is_empty() {
        log::warn!(
            "Dropping {} magnet file indices out of range [0, {})",
            invalid.len(),
            num_files
        );
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HASH_HEX: &str = "d1101a2b9d202811a05e8c57c557a20bf974dc8a";

    fn hash_bytes() -> [u8; 20] {
        let mut hash = [0; 20];
        hash.copy_from_slice(&hex::decode(HASH_HEX).unwrap());
        hash
    }

    #[test]
    fn test_parse_hex_btih() {
        let uri = format!("magnet:?xt=urn:btih:{}&dn=test", HASH_HEX);
        let magnet = MagnetInfo::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, InfoHash::V1(hash_bytes()));
        assert_eq!(magnet.name.as_deref(), Some("test"));
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn test_parse_base32_btih() {
        let encoded = base32::encode(
            base32::Alphabet::RFC4648 { padding: false },
            &hash_bytes(),
        );
        assert_eq!(encoded.len(), 32);
        let uri = format!("magnet:?xt=urn:btih:{}", encoded.to_lowercase());
        let magnet = MagnetInfo::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, InfoHash::V1(hash_bytes()));
    }

    #[test]
    fn test_parse_btmh() {
        let hash = [0x5au8; 32];
        let uri = format!("magnet:?xt=urn:btmh:1220{}", hex::encode(hash));
        let magnet = MagnetInfo::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, InfoHash::V2(hash));
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        assert!(matches!(
            MagnetInfo::parse("http://example.com"),
            Err(MagnetError::NotMagnet)
        ));
        assert!(matches!(
            MagnetInfo::parse("magnet:?dn=nohash"),
            Err(MagnetError::MissingInfoHash)
        ));
        assert!(matches!(
            MagnetInfo::parse("magnet:?xt=urn:btih:zzzz"),
            Err(MagnetError::InvalidInfoHash(_))
        ));
    }

    #[test]
    fn test_parse_selection_hints() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&so=0,3-5,8&x.pe=0:4,3-4:1",
            HASH_HEX
        );
        let magnet = MagnetInfo::parse(&uri).unwrap();
        assert_eq!(magnet.selected_indices, Some(vec![0, 3, 4, 5, 8]));
        assert_eq!(
            magnet.priorities,
            Some(vec![
                (0, FilePriority::Maximum),
                (3, FilePriority::Low),
                (4, FilePriority::Low),
            ])
        );
    }

    #[test]
    fn test_invalid_hints_are_ignored() {
        // a backwards range and a priority out of range disable the hints
        // but don't fail the parse
        let uri = format!(
            "magnet:?xt=urn:btih:{}&so=5-3&x.pe=0:9",
            HASH_HEX
        );
        let magnet = MagnetInfo::parse(&uri).unwrap();
        assert_eq!(magnet.selected_indices, None);
        assert_eq!(magnet.priorities, None);
    }

    #[test]
    fn test_index_list_whitespace_and_dedupe() {
        assert_eq!(parse_index_list("1, 3 , 5-7").unwrap(), vec![1, 3, 5, 6, 7]);
        assert_eq!(parse_index_list("2,2,1-2").unwrap(), vec![1, 2]);
        assert_eq!(parse_index_list("").unwrap(), Vec::<FileIndex>::new());
    }

    #[test]
    fn test_uri_round_trip() {
        let magnet = MagnetInfo {
            info_hash: InfoHash::V1(hash_bytes()),
            name: Some("some torrent".into()),
            trackers: vec!["udp://tracker.example:1337/announce".into()],
            selected_indices: Some(vec![0, 2]),
            priorities: Some(vec![(2, FilePriority::High)]),
        };
        let reparsed = MagnetInfo::parse(&magnet.to_uri()).unwrap();
        assert_eq!(reparsed, magnet);
    }

    #[test]
    fn test_clamp_indices() {
        assert_eq!(clamp_indices(&[0, 2, 7], 3), vec![0, 2]);
        assert_eq!(clamp_indices(&[], 3), Vec::<FileIndex>::new());
    }
}
