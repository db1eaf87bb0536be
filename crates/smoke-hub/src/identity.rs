//! Client identity carried inside the encrypted identity token.
//!
//! The hub keeps no copy of an identity. It is minted on connect, handed to
//! the client encrypted, and checked again on every forward.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Binds a network endpoint to the virtual address it was allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Remote address the client connected from.
    #[serde(rename = "remoteAddr")]
    pub remote_addr: String,
    /// Virtual address allocated to the client.
    pub address: String,
}

impl Identity {
    pub fn new(remote_addr: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            address: address.into(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// True when the request's remote address matches the one this identity
    /// was issued to.
    pub fn is_bound_to(&self, remote_addr: &str) -> bool {
        self.remote_addr == remote_addr
    }
}

/// Which part of the TCP peer address an identity is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBinding {
    /// Full `ip:port`.
    #[default]
    Socket,
    /// IP only, for clients whose source port changes between requests.
    Ip,
}

impl RemoteBinding {
    pub fn remote_addr(self, peer: SocketAddr) -> String {
        match self {
            RemoteBinding::Socket => peer.to_string(),
            RemoteBinding::Ip => peer.ip().to_string(),
        }
    }
}

impl std::str::FromStr for RemoteBinding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socket" => Ok(RemoteBinding::Socket),
            "ip" => Ok(RemoteBinding::Ip),
            other => Err(format!("unknown identity binding: {}", other)),
        }
    }
}
