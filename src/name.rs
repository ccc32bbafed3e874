use crate::*;
use sha2::{Digest, Sha256};
use std::fmt;

pub const NAME_LEN: usize = 32;
pub const HEX_NAME_LEN: usize = 2 * NAME_LEN;

/// Content identifier of a stored object.
///
/// A name is the SHA-256 over the object's dependency count (4 bytes
/// big-endian), its dependency names in ascending byte order, then the
/// object's bytes. Two objects with the same bytes but different
/// dependencies therefore get different names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName([u8; NAME_LEN]);

impl ObjectName {
    pub const fn from_bytes(bytes: [u8; NAME_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> FsResult<Self> {
        let arr: [u8; NAME_LEN] = bytes.try_into().map_err(|_| FsError::InvalidName)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the 64-char lowercase hex form.
    pub fn parse_hex(s: &str) -> FsResult<Self> {
        if s.len() != HEX_NAME_LEN {
            return Err(FsError::InvalidName);
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(FsError::InvalidName);
        }
        let raw = hex::decode(s).map_err(|_| FsError::InvalidName)?;
        Self::from_slice(&raw)
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({})", self.to_hex())
    }
}

/// Streaming name computation: dependencies are folded in up front, content
/// bytes as they arrive.
pub struct NameDigest {
    hasher: Sha256,
}

impl NameDigest {
    pub fn new(deps: &[ObjectName]) -> Self {
        let mut sorted: Vec<&ObjectName> = deps.iter().collect();
        sorted.sort();

        let mut hasher = Sha256::new();
        hasher.update((deps.len() as u32).to_be_bytes());
        for dep in sorted {
            hasher.update(dep.as_bytes());
        }
        Self { hasher }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finalize(&mut self) -> ObjectName {
        let digest = self.hasher.finalize_reset();
        ObjectName(digest.into())
    }
}

pub fn compute_name(content: &[u8], deps: &[ObjectName]) -> ObjectName {
    let mut d = NameDigest::new(deps);
    d.update(content);
    d.finalize()
}
