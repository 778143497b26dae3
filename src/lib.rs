//! Rust implementation of a distributed Erlang node.
//!
//! This crate lets a Rust process participate as a first-class peer in an
//! Erlang cluster. It covers the whole stack needed for that:
//!
//! - [`term`] and [`codec`]: the External Term Format (ETF), Erlang's binary
//!   encoding of terms.
//! - [`epmd`]: a client for the Erlang Port Mapper Daemon plus an embedded
//!   EPMD server for self-contained clusters.
//! - [`handshake`]: the distribution handshake (MD5 challenge/response).
//! - [`message`] and [`connection`]: the protocol between connected nodes.
//! - [`mailbox`] and [`node`]: the local process model, i.e. named mailboxes
//!   with blocking receive, links and exit signals.
//!
//! Reference: [Distribution Protocol](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html)
//!
//! # Examples
//!
//! Ping an Erlang node running as `erl -sname foo`:
//!
//! ```no_run
//! let node = erl_node::node::NodeBuilder::new("bar")
//!     .cookie("secret cookie")
//!     .finish();
//! node.listen(0)?;
//! assert!(node.ping("foo", std::time::Duration::from_secs(5)));
//! # Ok::<(), erl_node::node::NodeError>(())
//! ```
#![warn(missing_docs)]

pub mod codec;
pub mod connection;
pub mod epmd;
pub mod flags;
pub mod handshake;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod term;

mod socket;

pub use flags::DistributionFlags;
pub use mailbox::Mailbox;
pub use node::{Node, NodeName};
pub use term::Term;

/// The incarnation number of a distributed node.
///
/// Every time a node with a given name registers itself in EPMD it is handed
/// a fresh creation. The creation is embedded in every pid, port and
/// reference minted by that incarnation, so identifiers from a restarted node
/// never compare equal to those of its predecessor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Creation(u32);

impl Creation {
    /// Makes a new [`Creation`] instance.
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Makes a random [`Creation`] instance.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Returns the value of this creation.
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Version of the distribution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DistributionProtocolVersion {
    /// Version 5 (pre OTP 23 handshake, `n` framing).
    V5 = 5,

    /// Version 6 (OTP 23 handshake, `N` framing).
    V6 = 6,
}

impl TryFrom<u16> for DistributionProtocolVersion {
    type Error = crate::epmd::EpmdError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(Self::V5),
            6 => Ok(Self::V6),
            _ => Err(crate::epmd::EpmdError::UnknownVersion { value }),
        }
    }
}

/// Protocol for communicating with a distributed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportProtocol {
    /// TCP/IPv4.
    TcpIpV4 = 0,
}

impl TryFrom<u8> for TransportProtocol {
    type Error = crate::epmd::EpmdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TcpIpV4),
            _ => Err(crate::epmd::EpmdError::UnknownProtocol { value }),
        }
    }
}
