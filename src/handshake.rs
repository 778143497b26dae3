//! Distribution Handshake implementation.
//!
//! This handshake is used by an Erlang node for connecting to another one.
//!
//! Two wire framings exist: the pre OTP 23 `n` messages (16-bit version plus
//! 32-bit flags) and the OTP 23 `N` messages (64-bit flags plus an explicit
//! creation). A node that sends the old framing but advertises
//! [`DistributionFlags::HANDSHAKE_23`] follows up with a `c` (complement)
//! message carrying the missing high flag word and its creation.
//!
//! See [Distribution Handshake](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html#distribution-handshake)
//! for more details.
use std::io::{Read, Write};

use crate::flags::DistributionFlags;
use crate::node::{LocalNode, NodeName};
use crate::socket::Socket;
use crate::{Creation, DistributionProtocolVersion};

const TAG_NAME_OLD: u8 = b'n';
const TAG_NAME_NEW: u8 = b'N';
const TAG_STATUS: u8 = b's';
const TAG_COMPLEMENT: u8 = b'c';
const TAG_REPLY: u8 = b'r';
const TAG_ACK: u8 = b'a';

/// A node on the other end of a completed handshake.
#[derive(Debug, Clone)]
pub struct PeerNode {
    /// The name of the peer node.
    pub name: NodeName,

    /// The distribution flags both sides may rely on.
    pub flags: DistributionFlags,

    /// The creation of the peer, when its framing carried one.
    pub creation: Option<Creation>,
}

/// Possible errors during a handshake.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// An unexpected message tag.
    #[error("expected a {expected} message, but got tag {tag}")]
    UnexpectedTag {
        /// The message we were waiting for.
        expected: &'static str,

        /// The tag byte actually received.
        tag: u8,
    },

    /// The peer answered our name with something other than `ok`.
    #[error("handshake was refused with status {status:?}")]
    InvalidStatus {
        /// The status text sent by the peer.
        status: String,
    },

    /// The caller rejected the peer by passing a non-ok status.
    #[error("handshake was rejected locally with status {status:?}")]
    Rejected {
        /// The status that was sent to the peer.
        status: String,
    },

    /// The peer talks an incompatible distribution protocol version.
    #[error("unsupported distribution protocol version {value}")]
    VersionMismatch {
        /// The version the peer announced.
        value: u16,
    },

    /// An `N` message from a peer that does not announce `HANDSHAKE_23`.
    #[error("peer used the OTP 23 framing without announcing HANDSHAKE_23")]
    MissingHandshake23,

    /// The peer lacks flags this implementation cannot work without.
    #[error("peer is missing the mandatory distribution flags {missing:?}")]
    MissingRequiredFlags {
        /// The mandatory flags the peer did not announce.
        missing: DistributionFlags,
    },

    /// The peer announced a malformed node name.
    #[error(transparent)]
    InvalidNodeName(#[from] crate::node::NodeNameError),

    /// The challenge digests did not match, i.e. the cookies differ.
    #[error("the peer presented a digest computed from a different cookie")]
    CookieMismatch,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Client (initiator) side of the handshake.
#[derive(Debug)]
pub struct ClientSideHandshake<T> {
    socket: Socket<T>,
    local_node: LocalNode,
    cookie: String,
}

impl<T> ClientSideHandshake<T>
where
    T: Read + Write,
{
    /// Makes a new [`ClientSideHandshake`] instance.
    ///
    /// `socket` is a fresh connection to the distribution port of the target
    /// node.
    pub fn new(socket: T, local_node: LocalNode, cookie: &str) -> Self {
        Self {
            socket: Socket::new(socket),
            local_node,
            cookie: cookie.to_owned(),
        }
    }

    /// Executes the whole client side handshake.
    pub fn execute(mut self) -> Result<(T, PeerNode), HandshakeError> {
        let sent_old_framing = self.local_node.chosen_version == DistributionProtocolVersion::V5;

        self.send_name(sent_old_framing)?;
        self.recv_status()?;
        let (peer_flags, peer_challenge, peer_name, peer_creation) = self.recv_challenge()?;
        check_mandatory_flags(peer_flags)?;
        if sent_old_framing && peer_flags.contains(DistributionFlags::HANDSHAKE_23) {
            self.send_complement()?;
        }

        let self_challenge = rand::random::<u32>();
        self.send_challenge_reply(peer_challenge, self_challenge)?;
        self.recv_challenge_ack(self_challenge)?;

        log::debug!(
            "handshake with {} completed (flags={:?})",
            peer_name,
            peer_flags
        );
        Ok((
            self.socket.into_inner(),
            PeerNode {
                name: peer_name,
                flags: peer_flags,
                creation: peer_creation,
            },
        ))
    }

    fn send_name(&mut self, old_framing: bool) -> Result<(), HandshakeError> {
        let name = self.local_node.name.to_string();
        let mut writer = self.socket.message_writer();
        if old_framing {
            writer.write_u8(TAG_NAME_OLD)?;
            writer.write_u16(DistributionProtocolVersion::V5 as u16)?;
            writer.write_u32(self.local_node.flags.bits() as u32)?;
            writer.write_all(name.as_bytes())?;
        } else {
            writer.write_u8(TAG_NAME_NEW)?;
            writer.write_u64(self.local_node.flags.bits())?;
            writer.write_u32(self.local_node.creation.get())?;
            writer.write_u16(name.len() as u16)?;
            writer.write_all(name.as_bytes())?;
        }
        writer.finish()?;
        Ok(())
    }

    fn recv_status(&mut self) -> Result<(), HandshakeError> {
        let mut reader = self.socket.message_reader()?;
        let tag = reader.read_u8()?;
        if tag != TAG_STATUS {
            return Err(HandshakeError::UnexpectedTag {
                expected: "status",
                tag,
            });
        }
        let status = reader.read_string()?;
        if status != "ok" {
            return Err(HandshakeError::InvalidStatus { status });
        }
        Ok(())
    }

    fn recv_challenge(
        &mut self,
    ) -> Result<(DistributionFlags, u32, NodeName, Option<Creation>), HandshakeError> {
        let mut reader = self.socket.message_reader()?;
        match reader.read_u8()? {
            TAG_NAME_OLD => {
                let version = reader.read_u16()?;
                if version != DistributionProtocolVersion::V5 as u16 {
                    return Err(HandshakeError::VersionMismatch { value: version });
                }
                let flags = DistributionFlags::from_bits_truncate(u64::from(reader.read_u32()?));
                let challenge = reader.read_u32()?;
                let name = reader.read_string()?.parse::<NodeName>()?;
                Ok((flags, challenge, name, None))
            }
            TAG_NAME_NEW => {
                let flags = DistributionFlags::from_bits_truncate(reader.read_u64()?);
                let challenge = reader.read_u32()?;
                let creation = Creation::new(reader.read_u32()?);
                let name = reader.read_u16_string()?.parse::<NodeName>()?;
                reader.finish()?;
                if !flags.contains(DistributionFlags::HANDSHAKE_23) {
                    return Err(HandshakeError::MissingHandshake23);
                }
                Ok((flags, challenge, name, Some(creation)))
            }
            tag => Err(HandshakeError::UnexpectedTag {
                expected: "challenge",
                tag,
            }),
        }
    }

    fn send_complement(&mut self) -> Result<(), HandshakeError> {
        let mut writer = self.socket.message_writer();
        writer.write_u8(TAG_COMPLEMENT)?;
        writer.write_u32((self.local_node.flags.bits() >> 32) as u32)?;
        writer.write_u32(self.local_node.creation.get())?;
        writer.finish()?;
        Ok(())
    }

    fn send_challenge_reply(
        &mut self,
        peer_challenge: u32,
        self_challenge: u32,
    ) -> Result<(), HandshakeError> {
        let digest = calc_digest(&self.cookie, peer_challenge);
        let mut writer = self.socket.message_writer();
        writer.write_u8(TAG_REPLY)?;
        writer.write_u32(self_challenge)?;
        writer.write_all(&digest)?;
        writer.finish()?;
        Ok(())
    }

    fn recv_challenge_ack(&mut self, self_challenge: u32) -> Result<(), HandshakeError> {
        let mut reader = self.socket.message_reader()?;
        let tag = reader.read_u8()?;
        if tag != TAG_ACK {
            return Err(HandshakeError::UnexpectedTag {
                expected: "challenge ack",
                tag,
            });
        }
        let mut digest = [0; 16];
        reader.read_exact(&mut digest)?;
        if digest != calc_digest(&self.cookie, self_challenge) {
            return Err(HandshakeError::CookieMismatch);
        }
        Ok(())
    }
}

/// Status the acceptor answers a `send_name` with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum HandshakeStatus {
    /// Continue the handshake.
    Ok,

    /// Continue; the peer is told it won the simultaneous-connect race.
    OkSimultaneous,

    /// Refuse the connection.
    Nok,

    /// Refuse the connection: the peer is not allowed.
    NotAllowed,

    /// Refuse the connection: a connection to that node is already alive.
    Alive,
}

impl HandshakeStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::OkSimultaneous => "ok_simultaneous",
            Self::Nok => "nok",
            Self::NotAllowed => "not_allowed",
            Self::Alive => "alive",
        }
    }
}

#[derive(Debug)]
struct RecvNameResult {
    flags: DistributionFlags,
    name: NodeName,
    creation: Option<Creation>,
    old_framing: bool,
}

/// Server (acceptor) side of the handshake.
#[derive(Debug)]
pub struct ServerSideHandshake<T> {
    socket: Socket<T>,
    local_node: LocalNode,
    cookie: String,
    peer: Option<RecvNameResult>,
}

impl<T> ServerSideHandshake<T>
where
    T: Read + Write,
{
    /// Makes a new [`ServerSideHandshake`] instance.
    pub fn new(socket: T, local_node: LocalNode, cookie: &str) -> Self {
        Self {
            socket: Socket::new(socket),
            local_node,
            cookie: cookie.to_owned(),
            peer: None,
        }
    }

    /// Executes the handshake until the name of the connecting peer is known.
    ///
    /// The caller can use the returned name to decide which
    /// [`HandshakeStatus`] to pass to [`ServerSideHandshake::execute_rest`],
    /// e.g. to resolve simultaneous-connect races.
    pub fn execute_recv_name(&mut self) -> Result<NodeName, HandshakeError> {
        let mut reader = self.socket.message_reader()?;
        let peer = match reader.read_u8()? {
            TAG_NAME_OLD => {
                let version = reader.read_u16()?;
                if version != DistributionProtocolVersion::V5 as u16 {
                    return Err(HandshakeError::VersionMismatch { value: version });
                }
                let flags = DistributionFlags::from_bits_truncate(u64::from(reader.read_u32()?));
                let name = reader.read_string()?.parse::<NodeName>()?;
                RecvNameResult {
                    flags,
                    name,
                    creation: None,
                    old_framing: true,
                }
            }
            TAG_NAME_NEW => {
                let flags = DistributionFlags::from_bits_truncate(reader.read_u64()?);
                let creation = Creation::new(reader.read_u32()?);
                let name = reader.read_u16_string()?.parse::<NodeName>()?;
                reader.finish()?;
                RecvNameResult {
                    flags,
                    name,
                    creation: Some(creation),
                    old_framing: false,
                }
            }
            tag => {
                return Err(HandshakeError::UnexpectedTag {
                    expected: "name",
                    tag,
                })
            }
        };
        check_mandatory_flags(peer.flags)?;
        let name = peer.name.clone();
        self.peer = Some(peer);
        Ok(name)
    }

    /// Executes the rest of the server side handshake.
    pub fn execute_rest(
        mut self,
        status: HandshakeStatus,
    ) -> Result<(T, PeerNode), HandshakeError> {
        let mut peer = self.peer.take().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "execute_recv_name() must succeed first",
            )
        })?;

        self.send_status(status)?;
        if !matches!(status, HandshakeStatus::Ok | HandshakeStatus::OkSimultaneous) {
            return Err(HandshakeError::Rejected {
                status: status.as_str().to_owned(),
            });
        }

        let peer_supports_v6 = peer.flags.contains(DistributionFlags::HANDSHAKE_23);
        let self_challenge = rand::random::<u32>();
        self.send_challenge(self_challenge, peer.old_framing && !peer_supports_v6)?;

        if peer.old_framing && peer_supports_v6 {
            let (flags_high, creation) = self.recv_complement()?;
            peer.flags |= DistributionFlags::from_bits_truncate(u64::from(flags_high) << 32);
            peer.creation = Some(creation);
        }

        let peer_challenge = self.recv_challenge_reply(self_challenge)?;
        self.send_challenge_ack(peer_challenge)?;

        log::debug!(
            "handshake with {} completed (flags={:?})",
            peer.name,
            peer.flags
        );
        Ok((
            self.socket.into_inner(),
            PeerNode {
                name: peer.name,
                flags: peer.flags,
                creation: peer.creation,
            },
        ))
    }

    fn send_status(&mut self, status: HandshakeStatus) -> Result<(), HandshakeError> {
        let mut writer = self.socket.message_writer();
        writer.write_u8(TAG_STATUS)?;
        writer.write_all(status.as_str().as_bytes())?;
        writer.finish()?;
        Ok(())
    }

    fn send_challenge(
        &mut self,
        challenge: u32,
        old_framing: bool,
    ) -> Result<(), HandshakeError> {
        let name = self.local_node.name.to_string();
        let mut writer = self.socket.message_writer();
        if old_framing {
            writer.write_u8(TAG_NAME_OLD)?;
            writer.write_u16(DistributionProtocolVersion::V5 as u16)?;
            writer.write_u32(self.local_node.flags.bits() as u32)?;
            writer.write_u32(challenge)?;
            writer.write_all(name.as_bytes())?;
        } else {
            writer.write_u8(TAG_NAME_NEW)?;
            writer.write_u64(self.local_node.flags.bits())?;
            writer.write_u32(challenge)?;
            writer.write_u32(self.local_node.creation.get())?;
            writer.write_u16(name.len() as u16)?;
            writer.write_all(name.as_bytes())?;
        }
        writer.finish()?;
        Ok(())
    }

    fn recv_complement(&mut self) -> Result<(u32, Creation), HandshakeError> {
        let mut reader = self.socket.message_reader()?;
        let tag = reader.read_u8()?;
        if tag != TAG_COMPLEMENT {
            return Err(HandshakeError::UnexpectedTag {
                expected: "complement",
                tag,
            });
        }
        let flags_high = reader.read_u32()?;
        let creation = Creation::new(reader.read_u32()?);
        Ok((flags_high, creation))
    }

    fn recv_challenge_reply(&mut self, self_challenge: u32) -> Result<u32, HandshakeError> {
        let mut reader = self.socket.message_reader()?;
        let tag = reader.read_u8()?;
        if tag != TAG_REPLY {
            return Err(HandshakeError::UnexpectedTag {
                expected: "challenge reply",
                tag,
            });
        }
        let peer_challenge = reader.read_u32()?;
        let mut digest = [0; 16];
        reader.read_exact(&mut digest)?;
        if digest != calc_digest(&self.cookie, self_challenge) {
            return Err(HandshakeError::CookieMismatch);
        }
        Ok(peer_challenge)
    }

    fn send_challenge_ack(&mut self, peer_challenge: u32) -> Result<(), HandshakeError> {
        let digest = calc_digest(&self.cookie, peer_challenge);
        let mut writer = self.socket.message_writer();
        writer.write_u8(TAG_ACK)?;
        writer.write_all(&digest)?;
        writer.finish()?;
        Ok(())
    }
}

fn check_mandatory_flags(peer_flags: DistributionFlags) -> Result<(), HandshakeError> {
    let mandatory = DistributionFlags::mandatory();
    if !peer_flags.contains(mandatory) {
        return Err(HandshakeError::MissingRequiredFlags {
            missing: mandatory - peer_flags,
        });
    }
    Ok(())
}

// The challenge is hashed as its unsigned decimal representation appended to
// the cookie.
fn calc_digest(cookie: &str, challenge: u32) -> [u8; 16] {
    md5::compute(format!("{}{}", cookie, challenge)).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LocalNode;
    use std::net::{TcpListener, TcpStream};

    fn local_node(name: &str) -> LocalNode {
        LocalNode::new(name.parse().expect("bad name"), Creation::new(42))
    }

    fn handshake_pair(
        client_node: LocalNode,
        client_cookie: &'static str,
        server_cookie: &'static str,
    ) -> (
        Result<(TcpStream, PeerNode), HandshakeError>,
        Result<(TcpStream, PeerNode), HandshakeError>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept failed");
            let mut handshake =
                ServerSideHandshake::new(stream, local_node("server@localhost"), server_cookie);
            handshake.execute_recv_name()?;
            handshake.execute_rest(HandshakeStatus::Ok)
        });

        let stream = TcpStream::connect(addr).expect("connect failed");
        let client_result =
            ClientSideHandshake::new(stream, client_node, client_cookie).execute();
        let server_result = server.join().expect("server thread panicked");
        (client_result, server_result)
    }

    #[test]
    fn v6_handshake_succeeds() {
        let (client, server) = handshake_pair(local_node("client@localhost"), "monster", "monster");
        let (_, peer_of_client) = client.expect("client side failed");
        let (_, peer_of_server) = server.expect("server side failed");

        assert_eq!(peer_of_client.name.to_string(), "server@localhost");
        assert_eq!(peer_of_server.name.to_string(), "client@localhost");
        assert_eq!(peer_of_server.creation, Some(Creation::new(42)));
        assert!(peer_of_client
            .flags
            .contains(DistributionFlags::mandatory()));
    }

    #[test]
    fn old_framing_with_complement_succeeds() {
        let mut node = local_node("client@localhost");
        node.chosen_version = DistributionProtocolVersion::V5;
        node.flags |= DistributionFlags::SPAWN; // lives in the high flag word

        let (client, server) = handshake_pair(node, "monster", "monster");
        let (_, peer_of_client) = client.expect("client side failed");
        let (_, peer_of_server) = server.expect("server side failed");

        // The complement message must have delivered the high word and the
        // creation despite the old framing.
        assert!(peer_of_server.flags.contains(DistributionFlags::SPAWN));
        assert_eq!(peer_of_server.creation, Some(Creation::new(42)));
        assert_eq!(peer_of_client.name.to_string(), "server@localhost");
    }

    #[test]
    fn cookie_mismatch_fails_both_sides() {
        let (client, server) =
            handshake_pair(local_node("client@localhost"), "monster", "imposter");
        assert!(matches!(server, Err(HandshakeError::CookieMismatch)));
        // The server closes without sending an ack, so the client observes
        // either the explicit mismatch or the dropped connection.
        assert!(client.is_err());
    }

    #[test]
    fn missing_mandatory_flags_are_refused() {
        let mut node = local_node("client@localhost");
        node.flags = DistributionFlags::HANDSHAKE_23 | DistributionFlags::UTF8_ATOMS;

        let (_, server) = handshake_pair(node, "monster", "monster");
        assert!(matches!(
            server,
            Err(HandshakeError::MissingRequiredFlags { .. })
        ));
    }
}
