use crate::bencode;
use crate::bencode::BencodeResult;
use crate::bencode::BencodeValue;
use sha1::Digest;
use sha1::Sha1;

/// Calculates the SHA-1 hash of the canonical encoding of an `info` value.
///
/// This is the torrent's identity: every client re-encodes the decoded
/// `info` dictionary canonically (keys in byte order) and hashes the result,
/// so any two compliant implementations agree on the digest.
///
/// # Arguments
/// * `info` - The verbatim `info` value as decoded from the metainfo
///
/// # Returns
/// * `BencodeResult<[u8; 20]>` - The 20-byte SHA-1 digest, or an error if
///   encoding fails
pub fn calculate_info_hash(info: &BencodeValue) -> BencodeResult<[u8; 20]> {
    let buffer = bencode::encode_to_vec(info)?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);

    Ok(info_hash)
}
