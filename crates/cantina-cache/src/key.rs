use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// The on-disk layout version for persisted records.
const RECORD_FORMAT: u32 = 1;

/// An opaque, case-sensitive identifier for one cacheable resource.
///
/// Keys are caller-supplied strings such as `menu:current` or
/// `dishes:top:category=mains`; the coordinator attaches no meaning to them.
/// Equality and hashing go through a sha256 digest of the raw key, which also
/// gives the key a stable path in the persistent store regardless of what
/// characters the raw key contains.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    raw: Arc<str>,
    hash: [u8; 32],
}

impl CacheKey {
    /// Creates a key from its raw string form.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw: String = raw.into();
        let hash = Sha256::digest(&raw);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");
        Self {
            raw: raw.into(),
            hash,
        }
    }

    /// The raw key as supplied by the caller.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The relative path of this key's persisted record.
    ///
    /// Hex-formatted like `v1/aa/bbccdd….json`, fanned out over the first
    /// hash byte so a single directory never accumulates every record.
    pub fn record_path(&self) -> String {
        let mut path = format!("v{RECORD_FORMAT}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push_str(".json");
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_paths() {
        let key = CacheKey::new("menu:current");

        let path = key.record_path();
        assert!(path.starts_with("v1/"));
        assert!(path.ends_with(".json"));
        // v1/ + 1 fanout byte + "/" + 31 remaining bytes + extension
        assert_eq!(path.len(), 3 + 2 + 1 + 62 + 5);

        // the path is stable across constructions
        assert_eq!(CacheKey::new("menu:current").record_path(), path);
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        assert_ne!(CacheKey::new("menu:current"), CacheKey::new("Menu:Current"));
        assert_eq!(CacheKey::new("menu:current"), CacheKey::new("menu:current"));
    }
}
