//! Canonical serialization of stored records --- the entity codec.
//!
//! Every value the key-value backend persists (file entries, shares,
//! object/chunk/block records, lock records, NSM registrations) goes
//! through this codec: a leading format version byte followed by the
//! bincode encoding of the record. Readers reject unknown versions so a
//! downgrade never silently misreads newer data.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Current record format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encodes a record with its format version prefix.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value).map_err(|e| Error::io(format!("encode record: {e}")))?;
    let mut bytes = Vec::with_capacity(1 + body.len());
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decodes a record, rejecting unknown format versions with a clear
/// error.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.first() {
        None => Err(Error::io("empty record")),
        Some(&FORMAT_VERSION) => bincode::deserialize(&bytes[1..])
            .map_err(|e| Error::io(format!("decode record: {e}"))),
        Some(&version) => Err(Error::InvalidArgument(format!(
            "unsupported record format version {version} (expected {FORMAT_VERSION})"
        ))),
    }
}
