//! Hash-named blob references.
//!
//! A [`BlobRef`] is the pair `(hashName, digest)` rendered as
//! `hashName-hexdigest`, e.g. `sha1-0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33`.
//! References are immutable after parsing and compare by their canonical
//! string form.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sha1::Digest;
use sha1::Sha1;

use crate::error::Error;

/// Hex digest length for a registered hash name, or `None` if the name is
/// not in the registry. The registry currently holds `sha1` only.
fn registered_digest_len(hash_name: &str) -> Option<usize> {
    match hash_name {
        "sha1" => Some(40),
        _ => None,
    }
}

/// An in-progress hash state for a registered hash function.
///
/// Cloning is cheap and [`BlobHash::hex_digest`] reads the digest of the
/// bytes written so far without consuming the state, so a caller can keep
/// feeding bytes after checking a match.
#[derive(Clone)]
pub enum BlobHash {
    Sha1(Sha1),
}

impl BlobHash {
    /// Fresh sha1 state.
    pub fn sha1() -> BlobHash {
        BlobHash::Sha1(Sha1::new())
    }

    /// Registered name of this hash function.
    pub fn hash_name(&self) -> &'static str {
        match self {
            BlobHash::Sha1(_) => "sha1",
        }
    }

    /// Feed bytes into the hash state.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            BlobHash::Sha1(h) => h.update(data),
        }
    }

    /// Lowercase hex digest of everything written so far.
    pub fn hex_digest(&self) -> String {
        match self {
            BlobHash::Sha1(h) => hex::encode(h.clone().finalize()),
        }
    }
}

/// A reference to a blob: `(hashName, digest)`, canonical form
/// `hashName-hexdigest`.
//
// Field order matters: the derived ordering on (hash_name, digest) is
// identical to ordering on the canonical string, because `-` sorts below
// every character permitted in a hash name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobRef {
    hash_name: String,
    digest: String,
}

impl BlobRef {
    /// Parse a canonical `hashName-hexdigest` string.
    ///
    /// Accepts `^[a-z0-9]+-[a-f0-9]+$`; anything else returns `None`.
    /// An unregistered hash name still parses (the reference can be
    /// carried and compared), it is just not [`supported`](Self::is_supported).
    pub fn parse(s: &str) -> Option<BlobRef> {
        let (name, digest) = s.split_once('-')?;
        if name.is_empty() || digest.is_empty() {
            return None;
        }
        if !name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
            return None;
        }
        if !digest.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9')) {
            return None;
        }
        Some(BlobRef {
            hash_name: name.to_string(),
            digest: digest.to_string(),
        })
    }

    /// Parse, panicking on invalid input. Tests and constants only.
    pub fn must_parse(s: &str) -> BlobRef {
        match BlobRef::parse(s) {
            Some(br) => br,
            None => panic!("invalid blobref {s:?}"),
        }
    }

    /// Build a reference from the current state of a hash.
    pub fn from_hash(hash: &BlobHash) -> BlobRef {
        BlobRef {
            hash_name: hash.hash_name().to_string(),
            digest: hash.hex_digest(),
        }
    }

    /// Sha1 reference for a byte slice.
    pub fn sha1_from_bytes(data: &[u8]) -> BlobRef {
        let mut h = BlobHash::sha1();
        h.update(data);
        BlobRef::from_hash(&h)
    }

    /// The hash name component.
    pub fn hash_name(&self) -> &str {
        &self.hash_name
    }

    /// The lowercase hex digest component.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Whether the hash name is registered and the digest has the
    /// registered length.
    pub fn is_supported(&self) -> bool {
        registered_digest_len(&self.hash_name) == Some(self.digest.len())
    }

    /// Fresh hash state for this reference's hash function, or `None` for
    /// an unregistered hash name.
    pub fn hash(&self) -> Option<BlobHash> {
        match self.hash_name.as_str() {
            "sha1" => Some(BlobHash::sha1()),
            _ => None,
        }
    }

    /// Whether the given hash state's current digest equals this
    /// reference's digest.
    pub fn hash_matches(&self, hash: &BlobHash) -> bool {
        hash.hash_name() == self.hash_name && hash.hex_digest() == self.digest
    }

    /// 32-bit reduction of the digest, used for shard routing and cache
    /// keying: big-endian 4-byte words of the decoded digest, XORed.
    pub fn sum32(&self) -> u32 {
        let mut h: u32 = 0;
        let mut word: u32 = 0;
        let mut word_bytes = 0;
        for pair in self.digest.as_bytes().chunks_exact(2) {
            let byte = (hex_val(pair[0]) << 4) | hex_val(pair[1]);
            word = (word << 8) | u32::from(byte);
            word_bytes += 1;
            if word_bytes == 4 {
                h ^= word;
                word = 0;
                word_bytes = 0;
            }
        }
        if word_bytes > 0 {
            h ^= word;
        }
        h
    }
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        // Parse guarantees lowercase hex digits.
        _ => 0,
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash_name, self.digest)
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({self})")
    }
}

impl FromStr for BlobRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlobRef::parse(s).ok_or_else(|| Error::malformed(format!("invalid blobref {s:?}")))
    }
}

impl Serialize for BlobRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlobRef::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid blobref {s:?}")))
    }
}

/// A blob reference together with the blob's size in bytes, as reported by
/// stat and enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedBlobRef {
    pub blob_ref: BlobRef,
    pub size: u64,
}

impl SizedBlobRef {
    pub fn new(blob_ref: BlobRef, size: u64) -> SizedBlobRef {
        SizedBlobRef { blob_ref, size }
    }
}

impl fmt::Display for SizedBlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} bytes]", self.blob_ref, self.size)
    }
}
