//! Content hashing for sources without native fingerprints.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use assetsync_common::{Fingerprint, RevisionToken};

type Blake2b256 = Blake2b<U32>;

/// Blake2b-256 hex digest of a file's bytes.
pub fn content_fingerprint(content: &[u8]) -> Fingerprint {
    let mut hasher = Blake2b256::new();
    hasher.update(content);
    Fingerprint::new(format!("{:x}", hasher.finalize()))
}

/// Revision token over a whole namespace.
///
/// Order-independent: entries are sorted by path before hashing.
pub fn revision_of<'a, I>(entries: I) -> RevisionToken
where
    I: IntoIterator<Item = (&'a str, &'a Fingerprint)>,
{
    let mut entries: Vec<(&str, &Fingerprint)> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Blake2b256::new();
    for (path, fingerprint) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_str().as_bytes());
        hasher.update([b'\n']);
    }
    RevisionToken::new(format!("{:x}", hasher.finalize()))
}
