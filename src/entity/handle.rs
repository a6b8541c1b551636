//! Defines the opaque, rename-stable file handle --- [`FileHandle`].
//!
//! Adapters treat handles as byte strings of bounded size and pass them
//! back verbatim; encode/decode is the core's responsibility. A handle
//! stays valid across rename and goes stale only when the underlying
//! entry is destroyed.

use std::io::Cursor;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::entity::file::FileId;
use crate::error::{Error, Result};

/// Upper bound on handle length; fits the NFSv3 64-byte wire limit.
pub const MAX_HANDLE_LEN: usize = 64;

const HANDLE_VERSION: u8 = 1;

/// Opaque handle issued by the core. Layout (not part of the adapter
/// contract): version byte, share-name length, share-name bytes, 16-byte
/// entry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(pub Vec<u8>);

impl FileHandle {
    /// Encodes a handle for an entry of a share. Fails with
    /// [`Error::InvalidArgument`] when the share name would overflow the
    /// bounded handle size.
    pub fn encode(share: &str, id: FileId) -> Result<Self> {
        let name = share.as_bytes();
        if name.len() > MAX_HANDLE_LEN - 2 - 16 {
            return Err(Error::InvalidArgument(format!("share name too long: {share}")));
        }
        let mut bytes = Vec::with_capacity(2 + name.len() + 16);
        bytes.write_u8(HANDLE_VERSION).expect("vec write");
        bytes.write_u8(name.len() as u8).expect("vec write");
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(id.as_bytes());
        Ok(Self(bytes))
    }

    /// Decodes the share name and entry identifier. Every failure mode
    /// is [`Error::InvalidHandle`]; adapters cannot distinguish
    /// malformed from foreign handles.
    pub fn decode(&self) -> Result<(String, FileId)> {
        let mut cursor = Cursor::new(self.0.as_slice());
        if self.0.len() > MAX_HANDLE_LEN {
            return Err(Error::InvalidHandle);
        }
        let version = cursor.read_u8().map_err(|_| Error::InvalidHandle)?;
        if version != HANDLE_VERSION {
            return Err(Error::InvalidHandle);
        }
        let name_len = cursor.read_u8().map_err(|_| Error::InvalidHandle)? as usize;
        let rest = &self.0[2..];
        if rest.len() != name_len + 16 {
            return Err(Error::InvalidHandle);
        }
        let share = std::str::from_utf8(&rest[..name_len])
            .map_err(|_| Error::InvalidHandle)?
            .to_owned();
        let id = FileId::from_slice(&rest[name_len..]).ok_or(Error::InvalidHandle)?;
        Ok((share, id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
