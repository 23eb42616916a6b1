//! File fingerprinting: a 64-bit hash of up to the first 64 bytes of a file,
//! used to disambiguate files that share an inode across a restart (inode
//! reuse). Grounded on `calcFingerprint` in `logfile.go`; `twox-hash`'s
//! `XxHash64` stands in for `github.com/cespare/xxhash/v2`.

use twox_hash::XxHash64;
use std::hash::Hasher;

/// Maximum number of leading bytes hashed to compute a fingerprint. 64 bytes
/// is enough because container runtime log lines start with a
/// nanosecond-precision timestamp, so distinct files have unique prefixes.
pub const MAX_FINGERPRINT_DATA_LEN: usize = 64;

/// A hash of 0 is reserved to mean "fingerprint not yet computed", so a
/// genuine all-zero hash is remapped to 1.
const UNSET_FINGERPRINT: u64 = 0;
const UNSET_FINGERPRINT_REPLACEMENT: u64 = 1;

pub fn calc_fingerprint(data: &[u8]) -> u64 {
    let data = &data[..data.len().min(MAX_FINGERPRINT_DATA_LEN)];
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    let hash = hasher.finish();
    if hash == UNSET_FINGERPRINT {
        UNSET_FINGERPRINT_REPLACEMENT
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_zero() {
        // No realistic input hits the zero hash, but the remap must still
        // hold for the reserved "unset" sentinel itself.
        assert_ne!(calc_fingerprint(b""), UNSET_FINGERPRINT);
    }

    #[test]
    fn truncates_to_max_len() {
        let short = vec![b'a'; MAX_FINGERPRINT_DATA_LEN];
        let long = vec![b'a'; MAX_FINGERPRINT_DATA_LEN + 100];
        assert_eq!(calc_fingerprint(&short), calc_fingerprint(&long));
    }

    #[test]
    fn distinguishes_different_prefixes() {
        assert_ne!(calc_fingerprint(b"foo"), calc_fingerprint(b"bar"));
    }
}
