//! Defines the content-addressed payload index records --- [`ObjectRecord`],
//! [`ChunkRecord`], [`BlockRecord`].
//!
//! The index records topology and reference state only; it never stores
//! payload bytes. One object is one logical payload version; objects are
//! split into chunks, chunks into blocks. Every tier is keyed by the
//! cryptographic hash of its content.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::entity::file::FileTime;
use crate::error::{Error, Result};

/// Length of a content hash in bytes (SHA-256).
pub const HASH_LEN: usize = 32;

/// Cryptographic content hash keying one index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; HASH_LEN]);

impl ContentHash {
    /// Hashes a byte string.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Hashes a sequence of child hashes; used to derive chunk hashes
    /// from block hashes and object hashes from chunk hashes.
    pub fn digest_children<'a>(children: impl IntoIterator<Item = &'a ContentHash>) -> Self {
        let mut hasher = Sha256::new();
        for child in children {
            hasher.update(child.0);
        }
        Self(hasher.finalize().into())
    }

    /// Lower-case hex form; this is the payload identifier string for
    /// object hashes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the hex form back. Fails with
    /// [`Error::InvalidArgument`] on malformed input.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text)
            .map_err(|_| Error::InvalidArgument(format!("malformed content hash: {text}")))?;
        let arr: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidArgument(format!("malformed content hash: {text}")))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One logical payload version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub hash: ContentHash,
    /// Total payload size in bytes.
    pub size: u64,
    pub chunk_count: u32,
    /// Number of file entries referencing this object. Never negative;
    /// decrement saturates at zero.
    pub refcount: u64,
    /// Set once every block of every chunk is durably uploaded.
    pub finalized: bool,
    pub created_at: FileTime,
}

/// A contiguous span of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub hash: ContentHash,
    /// Parent object; must exist when the chunk is recorded.
    pub object: ContentHash,
    /// Position within the object.
    pub index: u32,
    pub size: u64,
    pub block_count: u32,
    pub refcount: u64,
}

/// The upload unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: ContentHash,
    /// Parent chunk; must exist when the block is recorded.
    pub chunk: ContentHash,
    /// Position within the chunk.
    pub index: u32,
    pub size: u32,
    pub refcount: u64,
    /// Set when the payload store confirmed the upload.
    pub uploaded_at: Option<FileTime>,
}

impl BlockRecord {
    /// A block is durable iff its upload completion time is recorded.
    pub fn is_durable(&self) -> bool {
        self.uploaded_at.is_some()
    }
}
