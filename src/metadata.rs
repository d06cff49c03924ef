//! The metadata exchange (BEP 9) used to bootstrap magnet downloads: the
//! `info` dictionary is fetched from peers in 16 KiB pieces over the
//! extension protocol (BEP 10), assembled, and verified against the magnet's
//! info hash.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{metainfo, InfoHash};

/// The size of a metadata exchange piece. The last piece may be shorter.
pub(crate) const METADATA_PIECE_LEN: usize = 0x4000;

/// An upper bound on the advertised metadata size; anything larger is
/// treated as a bogus advertisement.
pub(crate) const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// The extension id under which we accept ut_metadata messages, as
/// advertised in our extension handshake.
pub(crate) const LOCAL_UT_METADATA_ID: u8 = 3;

/// How many peers one metadata piece may be requested from concurrently.
const MAX_REQUESTS_PER_PIECE: usize = 2;

/// The extension handshake dictionary (BEP 10).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension names to the ids the sending side accepts them under.
    pub m: HashMap<String, u8>,
    /// The size of the `info` dictionary in bytes, advertised by peers that
    /// have the metadata (BEP 9).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
    /// A human readable client and version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl ExtendedHandshake {
    /// Builds our extension handshake: we always accept ut_metadata, and
    /// advertise the metadata size once we have the metadata.
    pub fn new(metadata_size: Option<u32>) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_metadata".into(), LOCAL_UT_METADATA_ID);
        Self {
            m,
            metadata_size,
            v: Some(concat!("riptorrent ", env!("CARGO_PKG_VERSION")).into()),
        }
    }

    /// The id the remote accepts ut_metadata messages under, if any.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get("ut_metadata").copied()
    }
}

/// The message types of the ut_metadata extension.
pub(crate) const UT_MSG_REQUEST: u8 = 0;
pub(crate) const UT_MSG_DATA: u8 = 1;
pub(crate) const UT_MSG_REJECT: u8 = 2;

/// The bencoded header of a ut_metadata message. A data message carries the
/// raw piece bytes immediately after the bencoded dictionary.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UtMetadataMsg {
    pub msg_type: u8,
    pub piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u32>,
}

impl UtMetadataMsg {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: UT_MSG_REQUEST,
            piece,
            total_size: None,
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: UT_MSG_REJECT,
            piece,
            total_size: None,
        }
    }

    /// Encodes the message header, appending the raw data for a data
    /// message.
    pub fn encode(&self, data: Option<&[u8]>) -> Vec<u8> {
        let mut payload = serde_bencode::to_bytes(self)
            .expect("ut_metadata header is always encodable");
        if let Some(data) = data {
            payload.extend_from_slice(data);
        }
        payload
    }

    /// Splits a ut_metadata payload into its bencoded header and the
    /// trailing raw piece data (empty except for data messages).
    pub fn decode(payload: &[u8]) -> Option<(Self, &[u8])> {
        let header_len = metainfo::bencode_value_len(payload).ok()?;
        let header: Self =
            serde_bencode::from_bytes(&payload[..header_len]).ok()?;
        Some((header, &payload[header_len..]))
    }
}

/// The assembly state of one metadata fetch attempt.
pub(crate) struct MetadataExchange {
    /// The advertised size of the `info` dictionary.
    metadata_size: usize,
    /// The so far downloaded metadata pieces.
    pieces: Vec<Option<Vec<u8>>>,
    /// Outstanding requests per metadata piece: at most one per peer, at
    /// most [`MAX_REQUESTS_PER_PIECE`] across peers.
    outstanding: HashMap<u32, Vec<(SocketAddr, Instant)>>,
    /// Which peer supplied each stored piece, for blacklisting when the
    /// assembled metadata doesn't hash to the info hash.
    contributors: HashMap<u32, SocketAddr>,
    /// Peers that contributed to a failed assembly; they are not asked
    /// again.
    blacklist: HashSet<SocketAddr>,
}

impl MetadataExchange {
    /// Creates an exchange for an advertised metadata size. Returns `None`
    /// for a bogus size.
    pub fn new(metadata_size: usize) -> Option<Self> {
        if metadata_size == 0 || metadata_size > MAX_METADATA_SIZE {
            log::warn!("Bogus advertised metadata size {}", metadata_size);
            return None;
        }
        let piece_count =
            (metadata_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        Some(Self {
            metadata_size,
            pieces: vec![None; piece_count],
            outstanding: HashMap::new(),
            contributors: HashMap::new(),
            blacklist: HashSet::new(),
        })
    }

    pub fn metadata_size(&self) -> usize {
        self.metadata_size
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_blacklisted(&self, peer: &SocketAddr) -> bool {
        self.blacklist.contains(peer)
    }

    /// Picks the next metadata piece to request from the peer, in
    /// round-robin fashion: the missing piece with the fewest outstanding
    /// requests, skipping pieces the peer was already asked for.
    pub fn next_request(&mut self, peer: SocketAddr) -> Option<u32> {
        if self.blacklist.contains(&peer) {
            return None;
        }
        let mut best: Option<(usize, u32)> = None;
        for index in 0..self.pieces.len() as u32 {
            if self.pieces[index as usize].is_some() {
                continue;
            }
            let requests = self.outstanding.get(&index);
            let count = requests.map(|r| r.len()).unwrap_or(0);
            if count >= MAX_REQUESTS_PER_PIECE {
                continue;
            }
            if requests
                .map(|r| r.iter().any(|(addr, _)| *addr == peer))
                .unwrap_or(false)
            {
                continue;
            }
            match best {
                Some((best_count, _)) if best_count <= count => {}
                _ => best = Some((count, index)),
            }
        }
        let (_, index) = best?;
        self.outstanding
            .entry(index)
            .or_default()
            .push((peer, Instant::now()));
        Some(index)
    }

    /// Stores a received metadata piece. Out of place or misshapen pieces
    /// are dropped.
    pub fn on_data(
        &mut self,
        peer: SocketAddr,
        index: u32,
        data: &[u8],
    ) -> bool {
        self.clear_request(&peer, index);

        let piece_count = self.pieces.len();
        let slot = match self.pieces.get_mut(index as usize) {
            Some(slot) => slot,
            None => return false,
        };
        let expected_len = if index as usize + 1 == piece_count {
            self.metadata_size - (piece_count - 1) * METADATA_PIECE_LEN
        } else {
            METADATA_PIECE_LEN
        };
        if data.len() != expected_len {
            log::warn!(
                "Metadata piece {} from {} has bad length {}",
                index,
                peer,
                data.len()
            );
            return false;
        }
        if slot.is_none() {
            *slot = Some(data.to_vec());
            self.contributors.insert(index, peer);
        }
        true
    }

    /// Registers a reject of a metadata request, clearing the outstanding
    /// entry so another peer can be asked.
    pub fn on_reject(&mut self, peer: &SocketAddr, index: u32) {
        self.clear_request(peer, index);
    }

    /// Clears a disconnected peer's outstanding requests.
    pub fn forget_peer(&mut self, peer: &SocketAddr) {
        for requests in self.outstanding.values_mut() {
            requests.retain(|(addr, _)| addr != peer);
        }
    }

    /// Expires outstanding requests older than the timeout so the pieces
    /// can be re-requested elsewhere.
    pub fn reap_timed_out_requests(&mut self, timeout: Duration, now: Instant) {
        for requests in self.outstanding.values_mut() {
            requests.retain(|(_, since)| {
                now.saturating_duration_since(*since) < timeout
            });
        }
    }

    fn clear_request(&mut self, peer: &SocketAddr, index: u32) {
        if let Some(requests) = self.outstanding.get_mut(&index) {
            requests.retain(|(addr, _)| addr != peer);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|piece| piece.is_some())
    }

    /// Once all pieces are present, assembles them and verifies the result
    /// against the info hash.
    ///
    /// On success the exact `info` dictionary bytes are returned. On a hash
    /// mismatch all contributing peers are blacklisted, the assembly is
    /// reset for another attempt, and the contributors are returned in the
    /// error so the torrent can disconnect them.
    pub fn try_assemble(
        &mut self,
        info_hash: &InfoHash,
    ) -> Option<Result<Vec<u8>, Vec<SocketAddr>>> {
        if !self.is_complete() {
            return None;
        }
        let mut assembled = Vec::with_capacity(self.metadata_size);
        for piece in self.pieces.iter() {
            assembled
                .extend_from_slice(piece.as_ref().expect("piece missing"));
        }

        let matches = match info_hash {
            InfoHash::V1(expected) => {
                let hash: [u8; 20] = Sha1::digest(&assembled).into();
                hash == *expected
            }
            InfoHash::V2(expected) => {
                let hash: [u8; 32] = Sha256::digest(&assembled).into();
                hash == *expected
            }
        };

        if matches {
            Some(Ok(assembled))
        } else {
            log::warn!("Assembled metadata does not match the info hash");
            let offenders: Vec<SocketAddr> =
                self.contributors.values().copied().collect();
            self.blacklist.extend(offenders.iter().copied());
            self.contributors.clear();
            self.outstanding.clear();
            for piece in self.pieces.iter_mut() {
                *piece = None;
            }
            Some(Err(offenders))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_extended_handshake_encoding() {
        let handshake = ExtendedHandshake::new(Some(31000));
        let bytes = serde_bencode::to_bytes(&handshake).unwrap();
        let decoded: ExtendedHandshake =
            serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(LOCAL_UT_METADATA_ID));
        assert_eq!(decoded.metadata_size, Some(31000));

        // a minimal remote handshake without optional keys still parses
        let decoded: ExtendedHandshake =
            serde_bencode::from_bytes(b"d1:md11:ut_metadatai7eee").unwrap();
        assert_eq!(decoded.ut_metadata_id(), Some(7));
        assert_eq!(decoded.metadata_size, None);
    }

    #[test]
    fn test_ut_metadata_msg_round_trip_with_trailing_data() {
        let data = vec![0x5a; 100];
        let payload = UtMetadataMsg {
            msg_type: UT_MSG_DATA,
            piece: 1,
            total_size: Some(16484),
        }
        .encode(Some(&data));

        let (header, rest) = UtMetadataMsg::decode(&payload).unwrap();
        assert_eq!(header.msg_type, UT_MSG_DATA);
        assert_eq!(header.piece, 1);
        assert_eq!(header.total_size, Some(16484));
        assert_eq!(rest, &data[..]);

        // a request has no trailing data
        let payload = UtMetadataMsg::request(0).encode(None);
        let (header, rest) = UtMetadataMsg::decode(&payload).unwrap();
        assert_eq!(header.msg_type, UT_MSG_REQUEST);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_request_coordination() {
        // metadata of two and a half pieces
        let size = 2 * METADATA_PIECE_LEN + 100;
        let mut exchange = MetadataExchange::new(size).unwrap();
        assert_eq!(exchange.piece_count(), 3);

        let (first, second, third) = (addr(1), addr(2), addr(3));

        // round robin: each peer gets the least requested missing piece,
        // and no peer is asked twice for the same piece
        assert_eq!(exchange.next_request(first), Some(0));
        assert_eq!(exchange.next_request(first), Some(1));
        assert_eq!(exchange.next_request(first), Some(2));
        assert_eq!(exchange.next_request(first), None);

        // a second peer may duplicate each piece once
        assert_eq!(exchange.next_request(second), Some(0));
        assert_eq!(exchange.next_request(second), Some(1));
        assert_eq!(exchange.next_request(second), Some(2));
        // the cap of two outstanding requests per piece is reached
        assert_eq!(exchange.next_request(third), None);

        // a reject frees a slot for the third peer
        exchange.on_reject(&second, 1);
        assert_eq!(exchange.next_request(third), Some(1));
    }

    #[test]
    fn test_assembly_and_verification() {
        // build an "info dict" of arbitrary bytes across two pieces
        let mut info = vec![0u8; METADATA_PIECE_LEN + 200];
        for (i, b) in info.iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        let hash: [u8; 20] = Sha1::digest(&info).into();
        let info_hash = InfoHash::V1(hash);

        let mut exchange = MetadataExchange::new(info.len()).unwrap();
        let peer = addr(1);

        assert!(exchange.try_assemble(&info_hash).is_none());
        assert!(exchange.on_data(peer, 0, &info[..METADATA_PIECE_LEN]));
        assert!(exchange.on_data(peer, 1, &info[METADATA_PIECE_LEN..]));
        // a misshapen piece is dropped
        assert!(!exchange.on_data(peer, 1, &[0; 5]));
        // an out of range piece is dropped
        assert!(!exchange.on_data(peer, 9, &[0; 5]));

        let assembled = exchange.try_assemble(&info_hash).unwrap().unwrap();
        assert_eq!(assembled, info);
    }

    #[test]
    fn test_failed_assembly_blacklists_contributors() {
        let size = METADATA_PIECE_LEN + 1;
        let mut exchange = MetadataExchange::new(size).unwrap();
        let (first, second) = (addr(1), addr(2));
        let info_hash = InfoHash::V1([0xee; 20]);

        assert!(exchange.on_data(first, 0, &vec![1; METADATA_PIECE_LEN]));
        assert!(exchange.on_data(second, 1, &[2; 1]));

        let offenders = exchange.try_assemble(&info_hash).unwrap().unwrap_err();
        assert_eq!(offenders.len(), 2);
        assert!(exchange.is_blacklisted(&first));
        assert!(exchange.is_blacklisted(&second));

        // the assembly restarts from scratch and blacklisted peers are not
        // asked again
        assert!(!exchange.is_complete());
        assert_eq!(exchange.next_request(first), None);
        assert_eq!(exchange.next_request(addr(3)), Some(0));
    }

    #[test]
    fn test_bogus_metadata_size() {
        assert!(MetadataExchange::new(0).is_none());
        assert!(MetadataExchange::new(MAX_METADATA_SIZE + 1).is_none());
    }
}
