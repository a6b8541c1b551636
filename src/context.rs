//! Defines the validated caller identity record --- [`CallerContext`].
//!
//! Protocol adapters authenticate the caller at the wire boundary and
//! construct one context per request. The core never authenticates; it
//! only evaluates the identity it is handed against file permissions.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Authentication method the adapter validated the caller with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// No credentials presented.
    None,
    /// AUTH_SYS / AUTH_UNIX style uid/gid assertion.
    Unix,
    /// Kerberos v5 authentication only.
    Krb5,
    /// Kerberos v5 with integrity protection.
    Krb5i,
    /// Kerberos v5 with privacy protection.
    Krb5p,
    /// NTLM (SMB sessions).
    Ntlm,
}

/// Validated caller identity threaded through every core operation.
///
/// Carries the effective uid/gid, the supplementary group set, the
/// authentication method tag, the client network address and a
/// cancellation token honoured at every suspension point.
#[derive(Debug, Clone)]
pub struct CallerContext {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Supplementary group ids.
    pub groups: Vec<u32>,
    /// How the adapter authenticated this caller.
    pub auth: AuthMethod,
    /// Network address of the client, when known.
    pub client_addr: Option<IpAddr>,
    /// True when no identity was presented at all; permission evaluation
    /// then applies world bits only.
    pub anonymous: bool,
    /// Cooperative cancellation for this call.
    pub cancel: CancellationToken,
}

impl CallerContext {
    /// Context for an authenticated caller.
    pub fn new(uid: u32, gid: u32, groups: Vec<u32>, auth: AuthMethod) -> Self {
        Self {
            uid,
            gid,
            groups,
            auth,
            client_addr: None,
            anonymous: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Privileged (root) caller.
    pub fn root() -> Self {
        Self::new(0, 0, Vec::new(), AuthMethod::Unix)
    }

    /// Caller that presented no identity at all.
    pub fn anonymous() -> Self {
        Self {
            uid: u32::MAX,
            gid: u32::MAX,
            groups: Vec::new(),
            auth: AuthMethod::None,
            client_addr: None,
            anonymous: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches the client network address.
    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Attaches an externally-owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// True for the privileged user.
    pub fn is_root(&self) -> bool {
        !self.anonymous && self.uid == 0
    }

    /// True when `gid` is the caller's effective or supplementary group.
    pub fn in_group(&self, gid: u32) -> bool {
        !self.anonymous && (self.gid == gid || self.groups.contains(&gid))
    }

    /// Fails with [`Error::Cancelled`] once the caller's token fires.
    /// Checked at every suspension point.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
