//! Metainfo (.torrent) parsing.
//!
//! A typed, immutable view over a decoded torrent file: tracker URLs, the
//! per-piece SHA-1 digests, the file layout, and the info-hash that
//! identifies the torrent to trackers and peers.
use crate::bencode;
use crate::bencode::BencodeValue;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use thiserror::Error;

pub mod info_hash;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid metainfo format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("Date parse error")]
    DateParseError,
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;

/// One file carried by the torrent. Single-file torrents normalize to one
/// entry with an empty path; the data then lands at the sanitized torrent
/// name itself.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

/// Immutable, validated view of a metainfo file.
#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub announce: String,
    /// Alternate tracker URLs: the nested tiers of `announce-list`
    /// flattened and deduplicated, with the primary `announce` excluded.
    pub announce_list: Vec<String>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    /// The `info` value exactly as decoded, preserved for hashing.
    pub info: BencodeValue,
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
}

/**
Splits the concatenated SHA-1 digests from the `pieces` string.

# Torrent protocol context:
The `pieces` key inside `info` is one long byte string: the 20-byte SHA-1
digest of every piece, back to back, in piece-index order. Each 20-byte
chunk becomes one entry of the returned vector, and the position of the
chunk is the piece index it verifies.
*/
#[tracing::instrument(level = "trace", skip(pieces_bytes))]
fn parse_pieces(pieces_bytes: &[u8]) -> MetainfoResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidPiecesHashLength);
    }
    let mut hashes = Vec::with_capacity(pieces_bytes.len() / 20);
    for chunk in pieces_bytes.chunks_exact(20) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(chunk);
        hashes.push(hash);
    }
    Ok(hashes)
}

/**
Flattens the `announce-list` tiers into one deduplicated URL list.

The source format nests trackers one level deep (a list of tiers, each a
list of URLs). Tier semantics are not modeled here: every URL is a
candidate tracker, first occurrence wins, and the primary announce URL is
filtered out so callers do not announce to it twice.
*/
fn parse_announce_list(value: &BencodeValue, primary: &str) -> MetainfoResult<Vec<String>> {
    let BencodeValue::List(tiers) = value else {
        return Err(MetainfoError::InvalidFormat(
            "announce-list is not a list".to_string(),
        ));
    };

    let mut flattened = Vec::new();
    for tier in tiers {
        let BencodeValue::List(trackers) = tier else {
            return Err(MetainfoError::InvalidFormat(
                "announce tier is not a list".to_string(),
            ));
        };
        for tracker in trackers {
            let BencodeValue::String(s) = tracker else {
                return Err(MetainfoError::InvalidFormat(
                    "tracker URL is not a string".to_string(),
                ));
            };
            let url = String::from_utf8(s.clone()).map_err(|e| {
                MetainfoError::InvalidFormat(format!("tracker URL not UTF-8: {}", e))
            })?;
            if url != primary && !flattened.contains(&url) {
                flattened.push(url);
            }
        }
    }
    Ok(flattened)
}

/// Extracts the file list from a validated `info` dictionary, normalizing
/// the single-file shape (`length` key) into one pathless entry.
fn parse_files(
    info: &BTreeMap<Vec<u8>, BencodeValue>,
) -> MetainfoResult<Vec<FileEntry>> {
    match (info.get(b"length".as_slice()), info.get(b"files".as_slice())) {
        (Some(BencodeValue::Integer(length)), None) => {
            let length = u64::try_from(*length).map_err(|_| {
                MetainfoError::InvalidFormat("negative file length".to_string())
            })?;
            Ok(vec![FileEntry {
                length,
                path: Vec::new(),
            }])
        }
        (None, Some(BencodeValue::List(list))) => {
            let mut files = Vec::with_capacity(list.len());
            for file_value in list {
                let BencodeValue::Dict(file_dict) = file_value else {
                    return Err(MetainfoError::InvalidFormat(
                        "file entry is not a dict".to_string(),
                    ));
                };
                let length = match file_dict.get(b"length".as_slice()) {
                    Some(BencodeValue::Integer(i)) => u64::try_from(*i).map_err(|_| {
                        MetainfoError::InvalidFormat("negative file length".to_string())
                    })?,
                    _ => return Err(MetainfoError::MissingField("file length".to_string())),
                };
                let path = match file_dict.get(b"path".as_slice()) {
                    Some(BencodeValue::List(components)) => {
                        let mut path = Vec::with_capacity(components.len());
                        for component in components {
                            let BencodeValue::String(s) = component else {
                                return Err(MetainfoError::InvalidFormat(
                                    "file path component is not a string".to_string(),
                                ));
                            };
                            path.push(String::from_utf8(s.clone()).map_err(|e| {
                                MetainfoError::InvalidFormat(format!(
                                    "file path not UTF-8: {}",
                                    e
                                ))
                            })?);
                        }
                        if path.is_empty() {
                            return Err(MetainfoError::InvalidFormat(
                                "empty file path".to_string(),
                            ));
                        }
                        path
                    }
                    _ => return Err(MetainfoError::MissingField("file path".to_string())),
                };
                files.push(FileEntry { length, path });
            }
            if files.is_empty() {
                return Err(MetainfoError::InvalidFormat("empty files list".to_string()));
            }
            Ok(files)
        }
        _ => Err(MetainfoError::MissingField(
            "info requires exactly one of length / files".to_string(),
        )),
    }
}

impl Metainfo {
    /// Reads and parses a metainfo file from disk. Any bencode or
    /// validation failure is a fatal startup error for that torrent.
    pub fn from_file(path: impl AsRef<Path>) -> MetainfoResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /**
    Parses a bencoded metainfo document.

    # How it works:
    1. Decodes the whole input as one bencode value (trailing bytes are an
       error) and requires a dictionary at the root.
    2. Extracts `announce` and the `info` dictionary; `info` is kept
       verbatim so the info-hash is computed over exactly the bytes the
       torrent author encoded.
    3. Validates `piece length`, `pieces`, `name`, and the single/multi
       file shape, then derives piece hashes, total length, and the
       info-hash.
    */
    #[tracing::instrument(level = "debug", skip(bytes))]
    pub fn from_bytes(bytes: &[u8]) -> MetainfoResult<Self> {
        let root = bencode::decode(bytes)?;
        let BencodeValue::Dict(ref dict) = root else {
            return Err(MetainfoError::InvalidFormat(
                "root is not a dictionary".to_string(),
            ));
        };

        let announce = match dict.get(b"announce".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).map_err(|e| {
                MetainfoError::InvalidFormat(format!("announce URL not UTF-8: {}", e))
            })?,
            _ => return Err(MetainfoError::MissingField("announce".to_string())),
        };

        let info = dict
            .get(b"info".as_slice())
            .cloned()
            .ok_or_else(|| MetainfoError::MissingField("info".to_string()))?;
        let BencodeValue::Dict(ref info_dict) = info else {
            return Err(MetainfoError::InvalidFormat(
                "info is not a dictionary".to_string(),
            ));
        };

        let piece_length = match info_dict.get(b"piece length".as_slice()) {
            Some(BencodeValue::Integer(i)) if *i > 0 => u32::try_from(*i).map_err(|_| {
                MetainfoError::InvalidFormat("piece length too large".to_string())
            })?,
            Some(BencodeValue::Integer(_)) => {
                return Err(MetainfoError::InvalidFormat(
                    "piece length must be positive".to_string(),
                ));
            }
            _ => return Err(MetainfoError::MissingField("piece length".to_string())),
        };

        let piece_hashes = match info_dict.get(b"pieces".as_slice()) {
            Some(BencodeValue::String(s)) => parse_pieces(s)?,
            _ => return Err(MetainfoError::MissingField("pieces".to_string())),
        };

        let name = match info_dict.get(b"name".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).map_err(|e| {
                MetainfoError::InvalidFormat(format!("name not UTF-8: {}", e))
            })?,
            _ => return Err(MetainfoError::MissingField("name".to_string())),
        };

        let files = parse_files(info_dict)?;
        let total_length: u64 = files.iter().map(|f| f.length).sum();

        // The hash list and the file lengths describe the same data; a
        // count mismatch means the metainfo is lying about one of them.
        let expected_pieces = total_length.div_ceil(u64::from(piece_length)) as usize;
        if piece_hashes.len() != expected_pieces {
            return Err(MetainfoError::InvalidFormat(format!(
                "{} piece hashes for {} bytes of {}-byte pieces",
                piece_hashes.len(),
                total_length,
                piece_length
            )));
        }

        let announce_list = match dict.get(b"announce-list".as_slice()) {
            Some(value) => parse_announce_list(value, &announce)?,
            None => Vec::new(),
        };

        let creation_date = match dict.get(b"creation date".as_slice()) {
            Some(BencodeValue::Integer(timestamp)) => {
                let secs = u64::try_from(*timestamp).map_err(|_| MetainfoError::DateParseError)?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            Some(_) => {
                return Err(MetainfoError::InvalidFormat(
                    "creation date is not an integer".to_string(),
                ));
            }
            None => None,
        };

        let comment = match dict.get(b"comment".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.get(b"created by".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).unwrap_or_default(),
            _ => String::new(),
        };

        let info_hash = info_hash::calculate_info_hash(&info)?;

        Ok(Metainfo {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            info,
            info_hash,
            name,
            piece_length,
            piece_hashes,
            files,
            total_length,
        })
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /**
    Size in bytes of the piece at `index`.

    # How it works:
    1. Every piece except the last is exactly `piece_length` bytes.
    2. The last piece carries the remainder of `total_length`, unless the
       total divides evenly, in which case it is a full piece too.
    */
    pub fn piece_size(&self, index: usize) -> u32 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index + 1 < self.num_pieces() {
            return self.piece_length;
        }
        let remainder = self.total_length % u64::from(self.piece_length);
        if remainder == 0 {
            self.piece_length
        } else {
            remainder as u32
        }
    }

    /// Every tracker URL we know about: the primary announce first, then
    /// the flattened alternates.
    pub fn all_announce_urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.announce.as_str())
            .chain(self.announce_list.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_fixture() -> Vec<u8> {
        // 12-byte file, 16-byte pieces: one (short) piece.
        b"d8:announce23:http://tracker.test/ann4:infod6:lengthi12e4:name4:file6:pieces20:AAAAAAAAAAAAAAAAAAAA12:piece lengthi16eee"
            .to_vec()
    }

    #[test]
    fn parses_single_file_metainfo() {
        let m = Metainfo::from_bytes(&single_file_fixture()).unwrap();
        assert_eq!(m.announce, "http://tracker.test/ann");
        assert_eq!(m.name, "file");
        assert_eq!(m.piece_length, 16);
        assert_eq!(m.num_pieces(), 1);
        assert_eq!(m.total_length, 12);
        assert_eq!(m.files, vec![FileEntry { length: 12, path: Vec::new() }]);
        assert_eq!(m.piece_hashes[0], *b"AAAAAAAAAAAAAAAAAAAA");
    }

    #[test]
    fn short_last_piece_size() {
        let m = Metainfo::from_bytes(&single_file_fixture()).unwrap();
        assert_eq!(m.piece_size(0), 12);
        assert_eq!(m.piece_size(1), 0);
    }

    #[test]
    fn even_division_keeps_full_last_piece() {
        let raw = b"d8:announce23:http://tracker.test/ann4:infod6:lengthi32e4:name4:file6:pieces40:AAAAAAAAAAAAAAAAAAAABBBBBBBBBBBBBBBBBBBB12:piece lengthi16eee";
        let m = Metainfo::from_bytes(raw).unwrap();
        assert_eq!(m.num_pieces(), 2);
        assert_eq!(m.piece_size(1), 16);
    }

    #[test]
    fn parses_multi_file_layout() {
        let raw = b"d8:announce23:http://tracker.test/ann4:infod5:filesld6:lengthi10e4:pathl1:a2:bbeed6:lengthi6e4:pathl1:ceee4:name3:dir6:pieces20:AAAAAAAAAAAAAAAAAAAA12:piece lengthi16eee";
        let m = Metainfo::from_bytes(raw).unwrap();
        assert_eq!(m.total_length, 16);
        assert_eq!(m.files.len(), 2);
        assert_eq!(m.files[0].path, vec!["a".to_string(), "bb".to_string()]);
        assert_eq!(m.files[1].length, 6);
    }

    #[test]
    fn flattens_and_dedupes_announce_list() {
        let raw = b"d8:announce23:http://tracker.test/ann13:announce-listll23:http://tracker.test/ann22:http://backup.test/annel22:http://backup.test/ann21:http://third.test/annee4:infod6:lengthi12e4:name4:file6:pieces20:AAAAAAAAAAAAAAAAAAAA12:piece lengthi16eee";
        let m = Metainfo::from_bytes(raw).unwrap();
        assert_eq!(
            m.announce_list,
            vec![
                "http://backup.test/ann".to_string(),
                "http://third.test/ann".to_string(),
            ]
        );
        let all: Vec<&str> = m.all_announce_urls().collect();
        assert_eq!(all[0], "http://tracker.test/ann");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert!(matches!(
            Metainfo::from_bytes(b"d4:infod6:lengthi12e4:name4:file6:pieces20:AAAAAAAAAAAAAAAAAAAA12:piece lengthi16eeee"),
            Err(MetainfoError::MissingField(_))
        ));
        assert!(matches!(
            Metainfo::from_bytes(b"d8:announce23:http://tracker.test/anne"),
            Err(MetainfoError::MissingField(_))
        ));
    }

    #[test]
    fn rejects_bad_pieces_length() {
        let raw = b"d8:announce23:http://tracker.test/ann4:infod6:lengthi12e4:name4:file6:pieces19:AAAAAAAAAAAAAAAAAAA12:piece lengthi16eee";
        assert!(matches!(
            Metainfo::from_bytes(raw),
            Err(MetainfoError::InvalidPiecesHashLength)
        ));
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        // 40 bytes of data cannot fit one 16-byte piece hash.
        let raw = b"d8:announce23:http://tracker.test/ann4:infod6:lengthi40e4:name4:file6:pieces20:AAAAAAAAAAAAAAAAAAAA12:piece lengthi16eee";
        assert!(matches!(
            Metainfo::from_bytes(raw),
            Err(MetainfoError::InvalidFormat(_))
        ));
    }

    #[test]
    fn optional_metadata_fields_parse() {
        let raw = b"d8:announce23:http://tracker.test/ann7:comment5:hello10:created by4:mkt113:creation datei1700000000e4:infod6:lengthi12e4:name4:file6:pieces20:AAAAAAAAAAAAAAAAAAAA12:piece lengthi16eee";
        let m = Metainfo::from_bytes(raw).unwrap();
        assert_eq!(m.comment, "hello");
        assert_eq!(m.created_by, "mkt1");
        assert_eq!(
            m.creation_date,
            Some(UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000))
        );
    }

    #[test]
    fn from_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.torrent");
        std::fs::write(&path, single_file_fixture()).unwrap();
        let m = Metainfo::from_file(&path).unwrap();
        assert_eq!(m.name, "file");
        assert!(Metainfo::from_file(dir.path().join("missing.torrent")).is_err());
    }

    #[test]
    fn info_hash_is_stable() {
        let a = Metainfo::from_bytes(&single_file_fixture()).unwrap();
        let b = Metainfo::from_bytes(&single_file_fixture()).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }
}
