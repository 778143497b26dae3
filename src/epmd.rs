//! EPMD client and other EPMD related components.
//!
//! "EPMD" stands for "Erlang Port Mapper Daemon" and
//! it provides name resolution functionalities for distributed erlang nodes.
//!
//! Besides the [`EpmdClient`] this module offers an [`EpmdServer`], a small
//! embedded EPMD good enough to host a cluster of nodes built with this
//! crate, e.g. in tests or on hosts without an Erlang installation.
//!
//! See [EPMD Protocol (Erlang Official Doc)](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html#epmd-protocol)
//! for more details about the protocol.
use crate::node::NodeType;
use crate::socket::Socket;
use crate::{Creation, DistributionProtocolVersion, TransportProtocol};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Default EPMD listening port.
pub const DEFAULT_EPMD_PORT: u16 = 4369;

const TAG_NAMES_REQ: u8 = 110;
const TAG_STOP_REQ: u8 = 115;
const TAG_ALIVE2_X_RESP: u8 = 118;
const TAG_PORT2_RESP: u8 = 119;
const TAG_ALIVE2_REQ: u8 = 120;
const TAG_ALIVE2_RESP: u8 = 121;
const TAG_PORT_PLEASE2_REQ: u8 = 122;

/// Returns the EPMD port this process should use.
///
/// The `ERL_EPMD_PORT` environment variable takes precedence; otherwise this
/// is [`DEFAULT_EPMD_PORT`].
pub fn epmd_port() -> u16 {
    std::env::var("ERL_EPMD_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_EPMD_PORT)
}

/// A node entry registered in EPMD.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NodeEntry {
    /// The node name (the part before the `@`).
    pub name: String,

    /// The port number on which the node accepts connection requests.
    pub port: u16,

    /// The node type.
    pub node_type: NodeType,

    /// The protocol for communicating with the node.
    pub protocol: TransportProtocol,

    pub highest_version: DistributionProtocolVersion,
    pub lowest_version: DistributionProtocolVersion,

    /// Extra field.
    pub extra: Vec<u8>,
}

impl NodeEntry {
    /// Makes a new entry for a normal (visible) node.
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_owned(),
            port,
            node_type: NodeType::Normal,
            protocol: TransportProtocol::TcpIpV4,
            highest_version: DistributionProtocolVersion::V6,
            lowest_version: DistributionProtocolVersion::V5,
            extra: Vec::new(),
        }
    }

    /// Makes a new entry for a hidden node.
    pub fn new_hidden(name: &str, port: u16) -> Self {
        Self {
            name: name.to_owned(),
            port,
            node_type: NodeType::Hidden,
            protocol: TransportProtocol::TcpIpV4,
            highest_version: DistributionProtocolVersion::V6,
            lowest_version: DistributionProtocolVersion::V5,
            extra: Vec::new(),
        }
    }

    /// Makes a new entry for a non-Erlang node such as the ones built with
    /// this crate.
    pub fn new_cnode(name: &str, port: u16) -> Self {
        Self {
            name: name.to_owned(),
            port,
            node_type: NodeType::Cnode,
            protocol: TransportProtocol::TcpIpV4,
            highest_version: DistributionProtocolVersion::V6,
            lowest_version: DistributionProtocolVersion::V5,
            extra: Vec::new(),
        }
    }

    fn bytes_len(&self) -> usize {
        2 + // port
        1 + // node_type
        1 + // protocol
        2 + // highest_version
        2 + // lowest_version
        2 + self.name.len() + // name
        2 + self.extra.len() // extra
    }
}

/// EPMD related errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum EpmdError {
    /// Unknown response tag.
    #[error("received an unknown tag {tag} as the response of {request}")]
    UnknownResponseTag { request: &'static str, tag: u8 },

    /// Unknown node type.
    #[error("unknown node type {value}")]
    UnknownNodeType { value: u8 },

    /// Unknown protocol.
    #[error("unknown protocol {value}")]
    UnknownProtocol { value: u8 },

    /// Unknown distribution protocol version.
    #[error("unknown distribution protocol version {value}")]
    UnknownVersion { value: u16 },

    /// Too long request.
    #[error("request byte size must be less than 0xFFFF, but got {size} bytes")]
    TooLongRequest { size: usize },

    /// PORT_PLEASE2_REQ request failure.
    #[error("EPMD responded an error code {code} against a PORT_PLEASE2_REQ request")]
    GetNodeEntryError { code: u8 },

    /// ALIVE2_REQ request failure.
    #[error("EPMD responded an error code {code} against an ALIVE2_REQ request")]
    RegisterNodeError { code: u8 },

    /// Malformed NAMES_RESP line.
    #[error("found a malformed NAMES_RESP line: expected_format=\"name {{NAME}} at port {{PORT}}\", actual_line={line:?}")]
    MalformedNodeNameAndPortLine { line: String },

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// EPMD client.
#[derive(Debug)]
pub struct EpmdClient<T> {
    socket: Socket<T>,
}

impl<T> EpmdClient<T>
where
    T: Read + Write,
{
    /// Makes a new [`EpmdClient`] instance.
    ///
    /// `socket` is a connection to communicate with the target EPMD server.
    pub fn new(socket: T) -> Self {
        Self {
            socket: Socket::new(socket),
        }
    }

    /// Registers a node in EPMD.
    ///
    /// The connection created to the EPMD must be kept as long as the node is
    /// a distributed node. When the connection is closed, the node is
    /// automatically unregistered from the EPMD.
    ///
    /// Registering the same name and port twice is a no-op: the second
    /// registration is answered with the creation of the first.
    pub fn register(mut self, node: NodeEntry) -> Result<(T, Creation), EpmdError> {
        // Request.
        let size = 1 + node.bytes_len();
        let size = u16::try_from(size).map_err(|_| EpmdError::TooLongRequest { size })?;
        self.socket.write_u16(size)?;
        self.socket.write_all(&[TAG_ALIVE2_REQ])?;
        self.socket.write_u16(node.port)?;
        self.socket.write_all(&[node.node_type as u8, node.protocol as u8])?;
        self.socket.write_u16(node.highest_version as u16)?;
        self.socket.write_u16(node.lowest_version as u16)?;
        self.socket.write_u16(node.name.len() as u16)?;
        self.socket.write_all(node.name.as_bytes())?;
        self.socket.write_u16(node.extra.len() as u16)?;
        self.socket.write_all(&node.extra)?;
        self.socket.flush()?;

        // Response.
        match self.socket.read_u8()? {
            TAG_ALIVE2_RESP => {
                match self.socket.read_u8()? {
                    0 => {}
                    code => return Err(EpmdError::RegisterNodeError { code }),
                }

                let creation = Creation::new(u32::from(self.socket.read_u16()?));
                Ok((self.socket.into_inner(), creation))
            }
            TAG_ALIVE2_X_RESP => {
                match self.socket.read_u8()? {
                    0 => {}
                    code => return Err(EpmdError::RegisterNodeError { code }),
                }

                let creation = Creation::new(self.socket.read_u32()?);
                Ok((self.socket.into_inner(), creation))
            }
            tag => Err(EpmdError::UnknownResponseTag {
                request: "ALIVE2_REQ",
                tag,
            }),
        }
    }

    /// Gets all registered names from EPMD.
    pub fn get_names(mut self) -> Result<Vec<(String, u16)>, EpmdError> {
        // Request.
        self.socket.write_u16(1)?; // Length
        self.socket.write_all(&[TAG_NAMES_REQ])?;
        self.socket.flush()?;

        // Response.
        let _epmd_port = self.socket.read_u32()?;
        let node_info_text = self.socket.read_string()?;

        node_info_text
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(|line| NodeNameAndPort::from_str(line).map(|x| (x.name, x.port)))
            .collect()
    }

    /// Gets the distribution port (and other information) of
    /// the `node_name` node from EPMD.
    ///
    /// If the node has not been registered in the connected EPMD, this method
    /// will return `None`.
    pub fn get_node_info(mut self, node_name: &str) -> Result<Option<NodeEntry>, EpmdError> {
        // Request.
        let size = 1 + node_name.len();
        let size = u16::try_from(size).map_err(|_| EpmdError::TooLongRequest { size })?;
        self.socket.write_u16(size)?;
        self.socket.write_all(&[TAG_PORT_PLEASE2_REQ])?;
        self.socket.write_all(node_name.as_bytes())?;
        self.socket.flush()?;

        // Response.
        let tag = self.socket.read_u8()?;
        if tag != TAG_PORT2_RESP {
            return Err(EpmdError::UnknownResponseTag {
                request: "PORT_PLEASE2_REQ",
                tag,
            });
        }

        match self.socket.read_u8()? {
            0 => {}
            1 => {
                return Ok(None);
            }
            code => {
                return Err(EpmdError::GetNodeEntryError { code });
            }
        }

        Ok(Some(NodeEntry {
            port: self.socket.read_u16()?,
            node_type: NodeType::try_from(self.socket.read_u8()?)?,
            protocol: TransportProtocol::try_from(self.socket.read_u8()?)?,
            highest_version: self.socket.read_u16()?.try_into()?,
            lowest_version: self.socket.read_u16()?.try_into()?,
            name: self.socket.read_u16_string()?,
            extra: self.socket.read_u16_bytes()?,
        }))
    }

    /// Asks EPMD to forget the registration of `node_name`.
    ///
    /// This complements dropping the registration connection: a node that
    /// still holds its lease can unregister eagerly by name.
    pub fn stop(mut self, node_name: &str) -> Result<String, EpmdError> {
        // Request.
        let size = 1 + node_name.len();
        let size = u16::try_from(size).map_err(|_| EpmdError::TooLongRequest { size })?;
        self.socket.write_u16(size)?;
        self.socket.write_all(&[TAG_STOP_REQ])?;
        self.socket.write_all(node_name.as_bytes())?;
        self.socket.flush()?;

        // Response ("STOPPED" or "NOSTOP").
        let result = self.socket.read_string()?;
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct NodeNameAndPort {
    name: String,
    port: u16,
}

impl FromStr for NodeNameAndPort {
    type Err = EpmdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || EpmdError::MalformedNodeNameAndPortLine { line: s.to_owned() };

        if !s.starts_with("name ") {
            return Err(error());
        }

        let s = &s["name ".len()..];
        let pos = s.find(" at port ").ok_or_else(error)?;
        let name = s[..pos].to_string();
        let port = s[pos + " at port ".len()..].parse().map_err(|_| error())?;
        Ok(Self { name, port })
    }
}

#[derive(Debug)]
struct Registration {
    entry: NodeEntry,
    creation: u32,
}

#[derive(Debug, Default)]
struct EpmdServerState {
    nodes: Mutex<HashMap<String, Registration>>,
    next_creation: AtomicU32,
    stopped: AtomicBool,
}

/// An embedded EPMD server.
///
/// Listens on a local TCP port and serves the `ALIVE2`, `PORT_PLEASE2`,
/// `NAMES` and `STOP` requests. A registered node is forgotten as soon as its
/// registration connection closes.
#[derive(Debug)]
pub struct EpmdServer {
    state: Arc<EpmdServerState>,
    port: u16,
}

impl EpmdServer {
    /// Starts an EPMD server bound to `127.0.0.1:port`.
    ///
    /// Passing `0` lets the OS choose the port (useful in tests).
    pub fn start(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(EpmdServerState {
            next_creation: AtomicU32::new(1),
            ..Default::default()
        });

        let accept_state = Arc::clone(&state);
        std::thread::Builder::new()
            .name("epmd-acceptor".to_owned())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_state.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::warn!("EPMD accept failed: {e}");
                            continue;
                        }
                    };
                    let state = Arc::clone(&accept_state);
                    std::thread::spawn(move || {
                        if let Err(e) = handle_epmd_client(&state, stream, port) {
                            log::debug!("EPMD client connection ended: {e}");
                        }
                    });
                }
            })?;

        Ok(Self { state, port })
    }

    /// Returns the port this server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting new connections.
    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            // Wake the acceptor so it observes the flag.
            let _ = TcpStream::connect(("127.0.0.1", self.port));
        }
    }
}

impl Drop for EpmdServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_epmd_client(
    state: &EpmdServerState,
    stream: TcpStream,
    epmd_port: u16,
) -> std::io::Result<()> {
    let mut socket = Socket::new(stream);
    let mut reader = socket.message_reader()?;
    match reader.read_u8()? {
        TAG_ALIVE2_REQ => {
            let port = reader.read_u16()?;
            let node_type = reader.read_u8()?;
            let protocol = reader.read_u8()?;
            let highest_version = reader.read_u16()?;
            let lowest_version = reader.read_u16()?;
            let name = reader.read_u16_string()?;
            reader.finish()?;

            let node_type = NodeType::try_from(node_type)
                .map_err(|_| invalid_data("unknown node type"))?;
            let protocol = TransportProtocol::try_from(protocol)
                .map_err(|_| invalid_data("unknown protocol"))?;
            let highest_version = DistributionProtocolVersion::try_from(highest_version)
                .map_err(|_| invalid_data("unknown version"))?;
            let lowest_version = DistributionProtocolVersion::try_from(lowest_version)
                .map_err(|_| invalid_data("unknown version"))?;

            let (result, creation, owner) = {
                let mut nodes = lock(&state.nodes);
                match nodes.get(&name) {
                    // Re-registering the same name and port is a no-op and
                    // does not transfer the lease.
                    Some(existing) if existing.entry.port == port => {
                        (0u8, existing.creation, false)
                    }
                    Some(_) => (1, 0, false),
                    None => {
                        let creation = state.next_creation.fetch_add(1, Ordering::SeqCst);
                        nodes.insert(
                            name.clone(),
                            Registration {
                                entry: NodeEntry {
                                    name: name.clone(),
                                    port,
                                    node_type,
                                    protocol,
                                    highest_version,
                                    lowest_version,
                                    extra: Vec::new(),
                                },
                                creation,
                            },
                        );
                        (0, creation, true)
                    }
                }
            };

            socket.write_all(&[TAG_ALIVE2_X_RESP, result])?;
            socket.write_u16((creation >> 16) as u16)?;
            socket.write_u16(creation as u16)?;
            socket.flush()?;
            if result != 0 {
                return Ok(());
            }

            log::debug!("EPMD registered node {name:?} at port {port}");

            // This connection is now the registration lease. Wait for EOF.
            let mut buf = [0; 16];
            loop {
                match socket.read_exact(&mut buf[..1]) {
                    Ok(()) => continue,
                    Err(_) => break,
                }
            }
            if owner {
                lock(&state.nodes).remove(&name);
                log::debug!("EPMD unregistered node {name:?}");
            }
            Ok(())
        }
        TAG_PORT_PLEASE2_REQ => {
            let name = reader.read_string()?;
            let entry = lock(&state.nodes).get(&name).map(|r| r.entry.clone());
            match entry {
                None => {
                    socket.write_all(&[TAG_PORT2_RESP, 1])?;
                }
                Some(entry) => {
                    socket.write_all(&[TAG_PORT2_RESP, 0])?;
                    socket.write_u16(entry.port)?;
                    socket.write_all(&[entry.node_type as u8, entry.protocol as u8])?;
                    socket.write_u16(entry.highest_version as u16)?;
                    socket.write_u16(entry.lowest_version as u16)?;
                    socket.write_u16(entry.name.len() as u16)?;
                    socket.write_all(entry.name.as_bytes())?;
                    socket.write_u16(entry.extra.len() as u16)?;
                    socket.write_all(&entry.extra)?;
                }
            }
            socket.flush()
        }
        TAG_NAMES_REQ => {
            let mut text = String::new();
            for r in lock(&state.nodes).values() {
                text.push_str(&format!("name {} at port {}\n", r.entry.name, r.entry.port));
            }
            let mut buf = Vec::with_capacity(4 + text.len());
            buf.extend_from_slice(&u32::from(epmd_port).to_be_bytes());
            buf.extend_from_slice(text.as_bytes());
            socket.write_all(&buf)?;
            socket.flush()
        }
        TAG_STOP_REQ => {
            let name = reader.read_string()?;
            let removed = lock(&state.nodes).remove(&name).is_some();
            socket.write_all(if removed { b"STOPPED" } else { b"NOSTOP" })?;
            socket.flush()
        }
        tag => Err(invalid_data(&format!("unknown EPMD request tag {tag}"))),
    }
}

fn invalid_data(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_owned())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &EpmdServer) -> EpmdClient<TcpStream> {
        let stream =
            TcpStream::connect(("127.0.0.1", server.port())).expect("failed to connect to EPMD");
        EpmdClient::new(stream)
    }

    #[test]
    fn register_lookup_and_unregister_work() {
        let server = EpmdServer::start(0).expect("failed to start EPMD");

        let (lease, creation) = client(&server)
            .register(NodeEntry::new_hidden("foo", 3000))
            .expect("failed to register");
        assert!(creation.get() > 0);

        let info = client(&server)
            .get_node_info("foo")
            .expect("failed to look up")
            .expect("no such node");
        assert_eq!(info.name, "foo");
        assert_eq!(info.port, 3000);
        assert_eq!(info.node_type, NodeType::Hidden);

        let names = client(&server).get_names().expect("failed to get names");
        assert_eq!(names, vec![("foo".to_owned(), 3000)]);

        // Dropping the lease unregisters the node.
        std::mem::drop(lease);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let info = client(&server).get_node_info("foo").expect("lookup failed");
            if info.is_none() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "node was not dropped");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn double_publish_is_a_no_op() {
        let server = EpmdServer::start(0).expect("failed to start EPMD");

        let (_lease, creation) = client(&server)
            .register(NodeEntry::new_hidden("dup", 4000))
            .expect("first registration failed");
        let (_lease2, creation2) = client(&server)
            .register(NodeEntry::new_hidden("dup", 4000))
            .expect("second registration failed");
        assert_eq!(creation, creation2);

        let info = client(&server)
            .get_node_info("dup")
            .expect("lookup failed")
            .expect("no such node");
        assert_eq!(info.port, 4000);
    }

    #[test]
    fn unknown_nodes_yield_none() {
        let server = EpmdServer::start(0).expect("failed to start EPMD");
        let info = client(&server)
            .get_node_info("nonexistent")
            .expect("lookup failed");
        assert!(info.is_none());
    }

    #[test]
    fn stop_request_unregisters_by_name() {
        let server = EpmdServer::start(0).expect("failed to start EPMD");
        let (_lease, _creation) = client(&server)
            .register(NodeEntry::new_hidden("baz", 5000))
            .expect("registration failed");

        let reply = client(&server).stop("baz").expect("stop failed");
        assert_eq!(reply, "STOPPED");
        let info = client(&server).get_node_info("baz").expect("lookup failed");
        assert!(info.is_none());
    }
}
