//! Defines the exported namespace record --- [`Share`].

use serde::{Deserialize, Serialize};

use crate::context::AuthMethod;
use crate::entity::file::FileId;

/// Mutable share attributes, updatable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ShareOptions {
    /// Refuse every mutating operation on this share.
    pub read_only: bool,
    /// Refuse callers that presented no credentials.
    pub require_auth: bool,
    /// Client addresses (or CIDR strings, as the adapter resolves them)
    /// admitted to the share. Empty means everyone not denied.
    pub allowed_clients: Vec<String>,
    /// Client addresses refused outright. Deny wins over allow.
    pub denied_clients: Vec<String>,
    /// Authentication methods the share accepts. Empty means any.
    pub auth_methods: Vec<AuthMethod>,
}

/// A named, rooted namespace exported over every protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Unique share name.
    pub name: String,
    pub options: ShareOptions,
    /// Identifier of the root directory entry.
    pub root: FileId,
}

impl Share {
    pub fn new(name: &str, options: ShareOptions, root: FileId) -> Self {
        Self { name: name.to_owned(), options, root }
    }
}
