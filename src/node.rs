//! Node identity and the node runtime.
//!
//! The identity half covers [`NodeName`] parsing, cookie discovery and the
//! pid/port/reference generators. The runtime half is [`Node`]: the mailbox
//! and connection registries, the acceptor loop publishing itself in EPMD,
//! the per-connection reader threads and the `net_kernel` ping responder.
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::connection::{Connection, Receiver, RecvError};
use crate::epmd::{self, EpmdClient, EpmdError, NodeEntry};
use crate::flags::DistributionFlags;
use crate::handshake::{
    ClientSideHandshake, HandshakeError, HandshakeStatus, ServerSideHandshake,
};
use crate::mailbox::{Mailbox, MailboxCore};
use crate::message::Message;
use crate::term::{Atom, List, Pid, Port, Reference, Str, Term, Tuple};
use crate::{Creation, DistributionProtocolVersion};

/// Errors related to node names.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NodeNameError {
    /// The name does not contain an `@` character.
    #[error("node name {name:?} must contain an '@' character")]
    MissingAtmark {
        /// The offending name.
        name: String,
    },
}

/// The name of a node: `"${NAME}@${HOST}"`.
///
/// The part before the `@` (the "alive" name) is silently truncated to 255
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeName {
    name: String,
    host: String,
}

impl NodeName {
    /// Makes a new [`NodeName`] instance.
    pub fn new(name: &str, host: &str) -> Self {
        Self {
            name: truncate_alive(name.to_owned()),
            host: host.to_owned(),
        }
    }

    /// Parses `s` like [`FromStr`](std::str::FromStr) does, but completes a
    /// missing host part with the short hostname of this machine.
    pub fn complete(s: &str) -> Self {
        match s.parse() {
            Ok(name) => name,
            Err(_) => Self::new(s, &short_hostname()),
        }
    }

    /// The alive name (the part before the `@`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host name (the part after the `@`).
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl std::str::FromStr for NodeName {
    type Err = NodeNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.splitn(2, '@');
        if let (Some(name), Some(host)) = (tokens.next(), tokens.next()) {
            Ok(Self::new(name, host))
        } else {
            Err(NodeNameError::MissingAtmark { name: s.to_owned() })
        }
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.host)
    }
}

fn truncate_alive(mut name: String) -> String {
    if name.len() > 255 {
        let mut end = 255;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Type of a distributed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NodeType {
    /// Hidden node.
    Hidden = 72,

    /// Normal Erlang node.
    Normal = 77,

    /// Non-Erlang node, e.g. one built with this crate.
    Cnode = 110,
}

impl TryFrom<u8> for NodeType {
    type Error = crate::epmd::EpmdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            72 => Ok(Self::Hidden),
            77 => Ok(Self::Normal),
            110 => Ok(Self::Cnode),
            _ => Err(crate::epmd::EpmdError::UnknownNodeType { value }),
        }
    }
}

/// The identity a node presents during handshakes.
#[derive(Debug, Clone)]
pub struct LocalNode {
    /// The name of the node.
    pub name: NodeName,

    /// The creation of this node incarnation.
    pub creation: Creation,

    /// The capability flags of this node.
    pub flags: DistributionFlags,

    /// The lowest distribution protocol version this node speaks.
    pub lowest_version: DistributionProtocolVersion,

    /// The highest distribution protocol version this node speaks.
    pub highest_version: DistributionProtocolVersion,

    /// The version this node uses when initiating a handshake.
    ///
    /// [`DistributionProtocolVersion::V5`] selects the old `n` framing.
    pub chosen_version: DistributionProtocolVersion,
}

impl LocalNode {
    /// Makes a new [`LocalNode`] with the default flags and version range.
    pub fn new(name: NodeName, creation: Creation) -> Self {
        Self {
            name,
            creation,
            flags: DistributionFlags::new(),
            lowest_version: DistributionProtocolVersion::V5,
            highest_version: DistributionProtocolVersion::V6,
            chosen_version: DistributionProtocolVersion::V6,
        }
    }
}

/// Returns the default cookie of this user.
///
/// This is the first line of `$HOME/.erlang.cookie`, trimmed; the empty
/// string when the file cannot be read. The lookup runs once per process.
pub fn default_cookie() -> String {
    static COOKIE: OnceLock<String> = OnceLock::new();
    COOKIE.get_or_init(read_cookie_file).clone()
}

fn read_cookie_file() -> String {
    let Some(home) = home_dir() else {
        return String::new();
    };
    match std::fs::read_to_string(home.join(".erlang.cookie")) {
        Ok(text) => text.lines().next().unwrap_or("").trim().to_owned(),
        Err(_) => String::new(),
    }
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    let drive = std::env::var_os("HOMEDRIVE")?;
    let path = std::env::var_os("HOMEPATH")?;
    Some(PathBuf::from(drive).join(path))
}

#[cfg(not(windows))]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub(crate) fn short_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(|s| s.to_owned()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

// Identifier generators, mirroring the counters of the BEAM: a pid id wraps
// after 15 bits into the 13-bit serial, a port id is 28 bits, a reference is
// an 18-bit word followed by two full 32-bit words.
#[derive(Debug)]
struct IdCounter {
    pid_id: u32,
    pid_serial: u32,
    port_id: u32,
    ref_ids: [u32; 3],
}

impl Default for IdCounter {
    fn default() -> Self {
        Self {
            pid_id: 1,
            pid_serial: 0,
            port_id: 1,
            ref_ids: [1, 0, 0],
        }
    }
}

impl IdCounter {
    fn next_pid(&mut self, node: &str, creation: u32) -> Pid {
        let pid = Pid::new(node, self.pid_id, self.pid_serial, creation);
        self.pid_id += 1;
        if self.pid_id > 0x7FFF {
            self.pid_id = 0;
            self.pid_serial += 1;
            if self.pid_serial > 0x1FFF {
                self.pid_serial = 0;
            }
        }
        pid
    }

    #[allow(dead_code)]
    fn next_port(&mut self, node: &str, creation: u32) -> Port {
        let port = Port::new(node, self.port_id, creation);
        self.port_id = (self.port_id + 1) & 0x0FFF_FFFF;
        port
    }

    fn next_ref(&mut self, node: &str, creation: u32) -> Reference {
        let reference = Reference::new(node, self.ref_ids.to_vec(), creation);
        self.ref_ids[0] += 1;
        if self.ref_ids[0] > 0x3_FFFF {
            self.ref_ids[0] = 0;
            let (next, wrapped) = self.ref_ids[1].overflowing_add(1);
            self.ref_ids[1] = next;
            if wrapped {
                self.ref_ids[2] = self.ref_ids[2].wrapping_add(1);
            }
        }
        reference
    }
}

/// Observer of node level status changes.
///
/// All methods default to doing nothing, so implementors only override what
/// they care about.
pub trait NodeObserver: Send + Sync + 'static {
    /// The local node went up (published in EPMD) or down.
    fn local_status(&self, node: &NodeName, up: bool, info: Option<&str>) {
        let _ = (node, up, info);
    }

    /// A connection to `peer` was established or lost.
    fn remote_status(&self, peer: &NodeName, up: bool, info: Option<&str>) {
        let _ = (peer, up, info);
    }

    /// A connection attempt to or from `peer` failed.
    fn conn_attempt(&self, peer: &NodeName, incoming: bool, info: &str) {
        let _ = (peer, incoming, info);
    }
}

/// What to do with an inbound `REG_SEND` whose name is not registered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnknownRegSendPolicy {
    /// Drop the message silently, like the BEAM does.
    #[default]
    Drop,
}

/// Node level errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NodeError {
    /// The requested mailbox name is taken.
    #[error("the name {name:?} is already registered")]
    NameInUse {
        /// The contested name.
        name: String,
    },

    /// The peer is not registered in its EPMD.
    #[error("the node {peer:?} is not registered in EPMD")]
    PeerNotFound {
        /// The peer node name.
        peer: String,
    },

    /// The node already has a running acceptor.
    #[error("the node is already listening")]
    AlreadyListening,

    /// The node has been stopped.
    #[error("the node has been stopped")]
    Stopped,

    /// A malformed node name.
    #[error(transparent)]
    Name(#[from] NodeNameError),

    /// An EPMD request failed.
    #[error(transparent)]
    Epmd(#[from] EpmdError),

    /// A handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Sending over an established connection failed.
    #[error(transparent)]
    Send(#[from] crate::connection::SendError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Builder for [`Node`] instances.
pub struct NodeBuilder {
    name: NodeName,
    cookie: String,
    epmd_port: u16,
    flags: DistributionFlags,
    published: bool,
    send_cookie: bool,
    trace_level: u8,
    unknown_reg_send: UnknownRegSendPolicy,
    observer: Option<Arc<dyn NodeObserver>>,
}

impl std::fmt::Debug for NodeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("name", &self.name)
            .field("epmd_port", &self.epmd_port)
            .field("published", &self.published)
            .finish_non_exhaustive()
    }
}

impl NodeBuilder {
    /// Makes a new builder.
    ///
    /// A `name` without an `@` is completed with the short local hostname.
    /// The cookie defaults to [`default_cookie`] and the EPMD port to
    /// [`epmd::epmd_port`].
    pub fn new(name: &str) -> Self {
        Self {
            name: NodeName::complete(name),
            cookie: default_cookie(),
            epmd_port: epmd::epmd_port(),
            flags: DistributionFlags::new(),
            published: false,
            send_cookie: false,
            trace_level: 0,
            unknown_reg_send: UnknownRegSendPolicy::default(),
            observer: None,
        }
    }

    /// Sets the cookie.
    pub fn cookie(mut self, cookie: &str) -> Self {
        self.cookie = cookie.to_owned();
        self
    }

    /// Sets the EPMD port used for publishing and lookups.
    pub fn epmd_port(mut self, port: u16) -> Self {
        self.epmd_port = port;
        self
    }

    /// Sets the capability flags.
    pub fn flags(mut self, flags: DistributionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Publishes the node as a visible cluster member instead of a hidden
    /// C-node.
    pub fn published(mut self, published: bool) -> Self {
        self.published = published;
        self
    }

    /// Makes outgoing sends carry the cookie atom, and requires inbound ones
    /// to do the same.
    pub fn send_cookie(mut self, send_cookie: bool) -> Self {
        self.send_cookie = send_cookie;
        self
    }

    /// Sets the connection trace level (0 = off).
    pub fn trace_level(mut self, level: u8) -> Self {
        self.trace_level = level;
        self
    }

    /// Sets the policy for inbound `REG_SEND`s to unknown names.
    pub fn unknown_reg_send(mut self, policy: UnknownRegSendPolicy) -> Self {
        self.unknown_reg_send = policy;
        self
    }

    /// Installs a status observer.
    pub fn observer(mut self, observer: Arc<dyn NodeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Builds the node.
    ///
    /// No sockets are opened until [`Node::listen`] or the first outgoing
    /// connection.
    pub fn finish(self) -> Node {
        let mut flags = self.flags;
        if self.published {
            flags |= DistributionFlags::PUBLISHED;
        }
        let full_name = self.name.to_string();
        Node {
            core: Arc::new(NodeCore {
                name: self.name,
                full_name,
                cookie: self.cookie,
                epmd_port: self.epmd_port,
                flags,
                published: self.published,
                send_cookie: self.send_cookie,
                trace_level: self.trace_level,
                unknown_reg_send: self.unknown_reg_send,
                observer: self.observer,
                creation: AtomicU32::new(0),
                mailboxes: Mutex::new(MailboxRegistry::default()),
                connections: Mutex::new(HashMap::new()),
                connect_gates: Mutex::new(HashMap::new()),
                counters: Mutex::new(IdCounter::default()),
                listener: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MailboxRegistry {
    by_id: HashMap<(u32, u32), Arc<MailboxCore>>,
    by_name: HashMap<String, (u32, u32)>,
}

#[derive(Debug)]
struct ListenerHandle {
    port: u16,
    // Closing this stream unregisters the node from EPMD.
    _epmd_lease: TcpStream,
}

pub(crate) struct NodeCore {
    name: NodeName,
    full_name: String,
    cookie: String,
    epmd_port: u16,
    flags: DistributionFlags,
    published: bool,
    send_cookie: bool,
    trace_level: u8,
    unknown_reg_send: UnknownRegSendPolicy,
    observer: Option<Arc<dyn NodeObserver>>,
    creation: AtomicU32,
    mailboxes: Mutex<MailboxRegistry>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    connect_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    counters: Mutex<IdCounter>,
    listener: Mutex<Option<ListenerHandle>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeCore")
            .field("name", &self.full_name)
            .finish_non_exhaustive()
    }
}

/// A local node: the owner of mailboxes and connections.
///
/// Dropping the node stops it, i.e. unpublishes it from EPMD and closes
/// every connection and mailbox.
#[derive(Debug)]
pub struct Node {
    core: Arc<NodeCore>,
}

impl Node {
    /// The name of this node.
    pub fn name(&self) -> &NodeName {
        &self.core.name
    }

    /// The creation EPMD assigned to this node, zero before [`Node::listen`].
    pub fn creation(&self) -> Creation {
        Creation::new(self.core.creation.load(Ordering::SeqCst))
    }

    /// The port the acceptor is bound to, if listening.
    pub fn port(&self) -> Option<u16> {
        lock(&self.core.listener).as_ref().map(|l| l.port)
    }

    /// Creates a new mailbox, optionally registering `name` for it.
    pub fn create_mailbox(&self, name: Option<&str>) -> Result<Mailbox, NodeError> {
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::Stopped);
        }
        let pid = self.core.next_pid();
        let core = MailboxCore::new(pid);

        let mut registry = lock(&self.core.mailboxes);
        if let Some(name) = name {
            if registry.by_name.contains_key(name) {
                return Err(NodeError::NameInUse {
                    name: name.to_owned(),
                });
            }
            registry
                .by_name
                .insert(name.to_owned(), pid_key(core.pid()));
            core.set_registered_name(Some(name.to_owned()));
        }
        registry.by_id.insert(pid_key(core.pid()), Arc::clone(&core));
        drop(registry);

        Ok(Mailbox::from_parts(core, Arc::clone(&self.core)))
    }

    /// Starts the acceptor: binds `port` (0 lets the OS choose), publishes
    /// the node in EPMD and begins accepting inbound connections.
    ///
    /// Returns the bound port.
    pub fn listen(&self, port: u16) -> Result<u16, NodeError> {
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::Stopped);
        }
        if lock(&self.core.listener).is_some() {
            return Err(NodeError::AlreadyListening);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let port = listener.local_addr()?.port();

        let (lease, creation) = match self.core.publish(port) {
            Ok(result) => result,
            Err(e) => {
                let info = e.to_string();
                self.core.notify_local_status(false, Some(&info));
                return Err(e);
            }
        };
        self.core.creation.store(creation.get(), Ordering::SeqCst);
        *lock(&self.core.listener) = Some(ListenerHandle {
            port,
            _epmd_lease: lease,
        });

        let core = Arc::clone(&self.core);
        std::thread::Builder::new()
            .name(format!("acceptor-{}", self.core.full_name))
            .spawn(move || acceptor_loop(core, listener))?;

        // The net_kernel responder answers distribution pings. A user who
        // registered the name first keeps it.
        match self.create_mailbox(Some("net_kernel")) {
            Ok(mailbox) => {
                std::thread::Builder::new()
                    .name(format!("net-kernel-{}", self.core.full_name))
                    .spawn(move || net_kernel_loop(mailbox))?;
            }
            Err(NodeError::NameInUse { .. }) => {}
            Err(e) => return Err(e),
        }

        self.core.notify_local_status(true, None);
        log::info!(
            "node {} is listening on port {} (creation {})",
            self.core.full_name,
            port,
            creation.get()
        );
        Ok(port)
    }

    /// Pings the `net_kernel` process of `peer`, connecting if necessary.
    ///
    /// A peer name without `@` is completed with the local short hostname.
    /// Pinging the own node name is answered locally without touching any
    /// socket.
    pub fn ping(&self, peer: &str, timeout: Duration) -> bool {
        let peer_name = NodeName::complete(peer);
        if peer_name == self.core.name {
            return true;
        }

        let mailbox = match self.create_mailbox(None) {
            Ok(mailbox) => mailbox,
            Err(_) => return false,
        };
        let reference = Term::from(self.core.make_ref());
        let request = Term::from(Tuple::from(vec![
            Term::from(Atom::new("$gen_call")),
            Term::from(Tuple::from(vec![
                Term::from(mailbox.pid().clone()),
                reference.clone(),
            ])),
            Term::from(Tuple::from(vec![
                Term::from(Atom::new("is_auth")),
                Term::from(Atom::new(self.core.full_name.clone())),
            ])),
        ]));
        if let Err(e) = mailbox.try_send_to_name("net_kernel", &peer_name, request) {
            log::debug!("ping to {} failed: {}", peer_name, e);
            return false;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match mailbox.receive_timeout(remaining) {
                Ok(Some(Term::Tuple(tuple)))
                    if tuple.elements.len() == 2 && tuple.elements[0] == reference =>
                {
                    return tuple.elements[1] == Term::from(Atom::new("yes"));
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return false,
            }
        }
    }

    /// Lists the `(name, port)` pairs registered in the local EPMD.
    pub fn names(&self) -> Result<Vec<(String, u16)>, EpmdError> {
        let stream = TcpStream::connect(("127.0.0.1", self.core.epmd_port))?;
        EpmdClient::new(stream).get_names()
    }

    /// Stops the node: unpublishes it from EPMD, closes every connection and
    /// mailbox and reports `local_status(up=false)`.
    pub fn stop(&self) {
        self.core.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl NodeCore {
    fn local_node_snapshot(&self) -> LocalNode {
        let mut local = LocalNode::new(
            self.name.clone(),
            Creation::new(self.creation.load(Ordering::SeqCst)),
        );
        local.flags = self.flags;
        local
    }

    fn publish(&self, port: u16) -> Result<(TcpStream, Creation), NodeError> {
        let stream = TcpStream::connect(("127.0.0.1", self.epmd_port))?;
        let entry = if self.published {
            NodeEntry::new(self.name.name(), port)
        } else {
            NodeEntry::new_cnode(self.name.name(), port)
        };
        let (lease, creation) = EpmdClient::new(stream).register(entry)?;
        Ok((lease, creation))
    }

    pub(crate) fn is_local(&self, node_name: &str) -> bool {
        node_name == self.full_name
    }

    pub(crate) fn next_pid(&self) -> Pid {
        let creation = self.creation.load(Ordering::SeqCst);
        lock(&self.counters).next_pid(&self.full_name, creation)
    }

    pub(crate) fn make_ref(&self) -> Reference {
        let creation = self.creation.load(Ordering::SeqCst);
        lock(&self.counters).next_ref(&self.full_name, creation)
    }

    pub(crate) fn lookup_pid(&self, pid: &Pid) -> Option<Arc<MailboxCore>> {
        lock(&self.mailboxes).by_id.get(&pid_key(pid)).cloned()
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Option<Arc<MailboxCore>> {
        let registry = lock(&self.mailboxes);
        let key = registry.by_name.get(name)?;
        registry.by_id.get(key).cloned()
    }

    pub(crate) fn register_name(
        &self,
        core: &Arc<MailboxCore>,
        name: &str,
    ) -> Result<(), NodeError> {
        let mut registry = lock(&self.mailboxes);
        if registry.by_name.contains_key(name) {
            return Err(NodeError::NameInUse {
                name: name.to_owned(),
            });
        }
        if let Some(old) = core.registered_name() {
            registry.by_name.remove(&old);
        }
        registry
            .by_name
            .insert(name.to_owned(), pid_key(core.pid()));
        core.set_registered_name(Some(name.to_owned()));
        Ok(())
    }

    pub(crate) fn clear_name(&self, core: &Arc<MailboxCore>) {
        let mut registry = lock(&self.mailboxes);
        if let Some(old) = core.registered_name() {
            registry.by_name.remove(&old);
        }
        core.set_registered_name(None);
    }

    pub(crate) fn unregister_mailbox(&self, core: &Arc<MailboxCore>) {
        let mut registry = lock(&self.mailboxes);
        registry.by_id.remove(&pid_key(core.pid()));
        if let Some(name) = core.registered_name() {
            registry.by_name.remove(&name);
        }
    }

    pub(crate) fn existing_connection(&self, peer_name: &str) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .get(peer_name)
            .filter(|c| c.is_connected())
            .cloned()
    }

    /// Returns the connection to `peer_name`, establishing it if needed.
    ///
    /// Concurrent callers for the same peer serialize on a per-peer gate so
    /// exactly one of them performs the connect.
    pub(crate) fn get_connection_to(
        self: &Arc<Self>,
        peer_name: &str,
    ) -> Result<Arc<Connection>, NodeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::Stopped);
        }
        let peer: NodeName = peer_name.parse()?;
        let key = peer.to_string();

        if let Some(conn) = self.existing_connection(&key) {
            return Ok(conn);
        }

        let gate = Arc::clone(
            lock(&self.connect_gates)
                .entry(key.clone())
                .or_insert_with(Default::default),
        );
        let _guard = gate.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(conn) = self.existing_connection(&key) {
            return Ok(conn);
        }

        match self.connect_to(&peer) {
            Ok((conn, rx)) => {
                let conn = self.register_connection(conn);
                spawn_reader(Arc::clone(self), Arc::clone(&conn), rx);
                self.notify_remote_status(&peer, true, None);
                Ok(conn)
            }
            Err(e) => {
                if let Some(observer) = &self.observer {
                    observer.conn_attempt(&peer, false, &e.to_string());
                }
                Err(e)
            }
        }
    }

    fn connect_to(&self, peer: &NodeName) -> Result<(Connection, Receiver), NodeError> {
        let epmd_stream = TcpStream::connect((peer.host(), self.epmd_port))?;
        let entry = EpmdClient::new(epmd_stream)
            .get_node_info(peer.name())?
            .ok_or_else(|| NodeError::PeerNotFound {
                peer: peer.to_string(),
            })?;

        let stream = TcpStream::connect((peer.host(), entry.port))?;
        let handshake = ClientSideHandshake::new(stream, self.local_node_snapshot(), &self.cookie);
        let (stream, peer_node) = handshake.execute()?;

        let (conn, rx) = Connection::new(
            stream,
            self.name.clone(),
            peer_node,
            &self.cookie,
            self.send_cookie,
            self.trace_level,
        )?;
        Ok((conn, rx))
    }

    /// Inserts `conn` as the authoritative connection to its peer.
    ///
    /// An existing entry for the same peer name is replaced: the old
    /// connection is closed and its links broken with `noconnection`.
    fn register_connection(self: &Arc<Self>, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let key = conn.peer().name.to_string();
        let old = lock(&self.connections).insert(key.clone(), Arc::clone(&conn));
        if let Some(old) = old {
            old.close();
            self.break_links_for_node(&key);
            self.notify_remote_status(&old.peer().name, false, Some("replaced by a new connection"));
        }
        conn
    }

    /// Runs the teardown of a finished connection: unregisters it, breaks
    /// the links through it with `noconnection` and reports the peer down.
    fn connection_down(&self, conn: &Arc<Connection>, info: &str) {
        let key = conn.peer().name.to_string();
        {
            let mut connections = lock(&self.connections);
            match connections.get(&key) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(&key);
                }
                // The entry was already replaced; its links are not ours to
                // break anymore.
                _ => return,
            }
        }
        self.break_links_for_node(&key);
        self.notify_remote_status(&conn.peer().name, false, Some(info));
    }

    fn break_links_for_node(&self, peer_name: &str) {
        let mailboxes: Vec<Arc<MailboxCore>> =
            lock(&self.mailboxes).by_id.values().cloned().collect();
        let reason = Term::from(Atom::new("noconnection"));
        for mailbox in mailboxes {
            for linked in mailbox.take_links_for_node(peer_name) {
                mailbox.deliver_exit(linked, reason.clone(), false);
            }
        }
    }

    fn check_cookie(&self, conn: &Connection, cookie: &Atom) -> Result<(), String> {
        if conn.cookie_verified() {
            return Ok(());
        }
        if cookie.name == conn.expected_cookie() {
            conn.set_cookie_verified();
            return Ok(());
        }

        // One-shot notice to a disposable pid, built with the cookie the
        // peer itself presented so ours never leaves this node.
        let notice = Term::from(Tuple::from(vec![
            Term::from(Atom::new("$gen_cast")),
            Term::from(Tuple::from(vec![
                Term::from(Atom::new("print")),
                Term::from(Str::from(format!(
                    "~n** Bad cookie sent to {} **~n",
                    self.full_name
                ))),
                Term::from(List::nil()),
            ])),
        ]));
        let disposable = Pid::new(self.full_name.clone(), 0, 0, 0);
        if let Err(e) = conn.send_message(Message::send(cookie.clone(), disposable, notice)) {
            log::debug!("failed to send the bad cookie notice: {}", e);
        }
        Err(format!(
            "auth_error: bad cookie in a message from {}",
            conn.peer().name
        ))
    }

    // Returns `Err` only for terminal conditions that must tear the
    // connection down.
    fn dispatch(&self, conn: &Connection, message: Message) -> Result<(), String> {
        match message {
            Message::Send(m) => {
                self.check_cookie(conn, &m.cookie)?;
                if let Some(mailbox) = self.lookup_pid(&m.to_pid) {
                    mailbox.deliver_message(m.message);
                } else {
                    log::debug!("dropping a message to the unknown pid {}", m.to_pid);
                }
                Ok(())
            }
            Message::RegSend(m) => {
                self.check_cookie(conn, &m.cookie)?;
                match self.lookup_name(&m.to_name.name) {
                    Some(mailbox) => mailbox.deliver_message(m.message),
                    None => match self.unknown_reg_send {
                        UnknownRegSendPolicy::Drop => {
                            log::debug!(
                                "dropping a message to the unregistered name {:?}",
                                m.to_name.name
                            );
                        }
                    },
                }
                Ok(())
            }
            Message::Link(m) => {
                match self.lookup_pid(&m.to_pid) {
                    Some(mailbox) => mailbox.add_link(m.from_pid),
                    None => {
                        // The linked-to process does not exist; answer with
                        // the exit signal Erlang would produce.
                        let exit = Message::exit(
                            m.to_pid,
                            m.from_pid,
                            Term::from(Atom::new("noproc")),
                        );
                        if let Err(e) = conn.send_message(exit) {
                            log::debug!("failed to reply noproc to a link: {}", e);
                        }
                    }
                }
                Ok(())
            }
            Message::Unlink(m) => {
                if let Some(mailbox) = self.lookup_pid(&m.to_pid) {
                    mailbox.remove_link(&m.from_pid);
                }
                Ok(())
            }
            Message::Exit(m) => {
                if let Some(mailbox) = self.lookup_pid(&m.to_pid) {
                    mailbox.deliver_exit(m.from_pid, m.reason, true);
                }
                Ok(())
            }
            Message::Exit2(m) => {
                if let Some(mailbox) = self.lookup_pid(&m.to_pid) {
                    mailbox.deliver_exit(m.from_pid, m.reason, false);
                }
                Ok(())
            }
            Message::GroupLeader(_) => Ok(()),
            // Ticks are handled by the reader loop and the trace token
            // variants were normalized away before dispatch.
            Message::Tick
            | Message::SendTt { .. }
            | Message::ExitTt { .. }
            | Message::RegSendTt { .. }
            | Message::Exit2Tt { .. } => Ok(()),
        }
    }

    fn notify_local_status(&self, up: bool, info: Option<&str>) {
        if let Some(observer) = &self.observer {
            observer.local_status(&self.name, up, info);
        }
    }

    fn notify_remote_status(&self, peer: &NodeName, up: bool, info: Option<&str>) {
        if let Some(observer) = &self.observer {
            observer.remote_status(peer, up, info);
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the lease unpublishes the node; the loopback connect
        // wakes the acceptor so it can observe the stop flag.
        if let Some(handle) = lock(&self.listener).take() {
            let port = handle.port;
            drop(handle);
            let _ = TcpStream::connect(("127.0.0.1", port));
        }

        let connections: Vec<Arc<Connection>> = lock(&self.connections).drain().map(|(_, c)| c).collect();
        for conn in &connections {
            conn.close();
        }
        for conn in &connections {
            self.break_links_for_node(&conn.peer().name.to_string());
        }

        let mailboxes: Vec<Arc<MailboxCore>> = {
            let mut registry = lock(&self.mailboxes);
            registry.by_name.clear();
            registry.by_id.drain().map(|(_, m)| m).collect()
        };
        for mailbox in mailboxes {
            mailbox.force_close();
        }

        self.notify_local_status(false, None);
        log::info!("node {} stopped", self.full_name);
    }
}

fn pid_key(pid: &Pid) -> (u32, u32) {
    (pid.id, pid.serial)
}

fn spawn_reader(core: Arc<NodeCore>, conn: Arc<Connection>, rx: Receiver) {
    let name = format!("reader-{}", conn.peer().name);
    let result = std::thread::Builder::new()
        .name(name)
        .spawn(move || reader_loop(core, conn, rx));
    if let Err(e) = result {
        log::error!("failed to spawn a reader thread: {}", e);
    }
}

// The single reader of one connection: decodes frames in order, answers
// ticks under the output lock and hands messages to the node for dispatch.
fn reader_loop(core: Arc<NodeCore>, conn: Arc<Connection>, mut rx: Receiver) {
    let info = loop {
        match rx.recv() {
            Ok(Message::Tick) => {
                if conn.send_message(Message::Tick).is_err() {
                    break "io_error: tock failed".to_owned();
                }
            }
            Ok(message) => {
                if let Err(info) = core.dispatch(&conn, message.normalize()) {
                    break info;
                }
            }
            Err(RecvError::Closed) => break "remote_closed".to_owned(),
            Err(RecvError::Decode(e)) => break format!("remote_garbage: {}", e),
            Err(e) => break format!("io_error: {}", e),
        }
    };
    log::debug!("connection to {} ended: {}", conn.peer().name, info);
    conn.close();
    core.connection_down(&conn, &info);
}

fn acceptor_loop(core: Arc<NodeCore>, listener: TcpListener) {
    for stream in listener.incoming() {
        if core.stopped.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                continue;
            }
        };
        let core = Arc::clone(&core);
        let result = std::thread::Builder::new()
            .name("inbound-handshake".to_owned())
            .spawn(move || handle_inbound(core, stream));
        if let Err(e) = result {
            log::error!("failed to spawn an inbound connection thread: {}", e);
        }
    }
}

fn handle_inbound(core: Arc<NodeCore>, stream: TcpStream) {
    let mut handshake =
        ServerSideHandshake::new(stream, core.local_node_snapshot(), &core.cookie);
    let peer_name = match handshake.execute_recv_name() {
        Ok(name) => name,
        Err(e) => {
            log::debug!("inbound handshake failed before the peer was known: {}", e);
            return;
        }
    };
    match handshake.execute_rest(HandshakeStatus::Ok) {
        Ok((stream, peer_node)) => {
            let connection = Connection::new(
                stream,
                core.name.clone(),
                peer_node,
                &core.cookie,
                core.send_cookie,
                core.trace_level,
            );
            match connection {
                Ok((conn, rx)) => {
                    let conn = core.register_connection(conn);
                    let peer = conn.peer().name.clone();
                    core.notify_remote_status(&peer, true, None);
                    // This thread becomes the connection's reader.
                    reader_loop(core, conn, rx);
                }
                Err(e) => log::warn!("failed to set up an inbound connection: {}", e),
            }
        }
        Err(e) => {
            if let Some(observer) = &core.observer {
                observer.conn_attempt(&peer_name, true, &e.to_string());
            }
            log::debug!("inbound handshake with {} failed: {}", peer_name, e);
        }
    }
}

fn net_kernel_loop(mailbox: Mailbox) {
    loop {
        match mailbox.receive() {
            Ok(request) => {
                if let Some((from, reference)) = parse_is_auth(&request) {
                    let reply = Term::from(Tuple::from(vec![
                        reference,
                        Term::from(Atom::new("yes")),
                    ]));
                    mailbox.send(&from, reply);
                } else {
                    log::debug!("net_kernel ignored the request {}", request);
                }
            }
            Err(_) => break,
        }
    }
}

// Matches `{'$gen_call', {FromPid, Ref}, {is_auth, Node}}`.
fn parse_is_auth(term: &Term) -> Option<(Pid, Term)> {
    let tuple = match term {
        Term::Tuple(tuple) if tuple.elements.len() == 3 => tuple,
        _ => return None,
    };
    if tuple.elements[0] != Term::from(Atom::new("$gen_call")) {
        return None;
    }
    let from_and_ref = match &tuple.elements[1] {
        Term::Tuple(inner) if inner.elements.len() == 2 => inner,
        _ => return None,
    };
    let from = match &from_and_ref.elements[0] {
        Term::Pid(pid) => pid.clone(),
        _ => return None,
    };
    let request = match &tuple.elements[2] {
        Term::Tuple(inner) if inner.elements.len() == 2 => inner,
        _ => return None,
    };
    if request.elements[0] != Term::from(Atom::new("is_auth")) {
        return None;
    }
    Some((from, from_and_ref.elements[1].clone()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailboxError;

    #[test]
    fn node_names_parse_and_complete() {
        let name: NodeName = "foo@bar.example.com".parse().expect("parse failed");
        assert_eq!(name.name(), "foo");
        assert_eq!(name.host(), "bar.example.com");
        assert_eq!(name.to_string(), "foo@bar.example.com");

        assert!("noatmark".parse::<NodeName>().is_err());

        let completed = NodeName::complete("foo");
        assert_eq!(completed.name(), "foo");
        assert!(!completed.host().is_empty());
    }

    #[test]
    fn alive_names_are_truncated() {
        let long = "x".repeat(300);
        let name = NodeName::new(&long, "host");
        assert_eq!(name.name().len(), 255);
    }

    #[test]
    fn pid_counter_cascades_into_the_serial() {
        let mut counter = IdCounter::default();
        let first = counter.next_pid("n@h", 7);
        assert_eq!((first.id, first.serial, first.creation), (1, 0, 7));

        counter.pid_id = 0x7FFF;
        let last_of_serial = counter.next_pid("n@h", 7);
        assert_eq!((last_of_serial.id, last_of_serial.serial), (0x7FFF, 0));
        let wrapped = counter.next_pid("n@h", 7);
        assert_eq!((wrapped.id, wrapped.serial), (0, 1));
    }

    #[test]
    fn reference_counter_cascades_across_words() {
        let mut counter = IdCounter::default();
        counter.ref_ids = [0x3_FFFF, u32::MAX, 0];
        let r = counter.next_ref("n@h", 1);
        assert_eq!(r.ids, vec![0x3_FFFF, u32::MAX, 0]);
        let r = counter.next_ref("n@h", 1);
        assert_eq!(r.ids, vec![0, 0, 1]);
    }

    #[test]
    fn port_counter_stays_within_28_bits() {
        let mut counter = IdCounter::default();
        counter.port_id = 0x0FFF_FFFF;
        let p = counter.next_port("n@h", 1);
        assert_eq!(p.id, 0x0FFF_FFFF);
        let p = counter.next_port("n@h", 1);
        assert_eq!(p.id, 0);
    }

    #[test]
    fn local_ping_needs_no_sockets() {
        // Deliberately unreachable EPMD port: a self ping must not use it.
        let node = NodeBuilder::new("selfping@localhost")
            .cookie("secret")
            .epmd_port(1)
            .finish();
        assert!(node.ping("selfping@localhost", Duration::from_millis(100)));
    }

    #[test]
    fn mailbox_names_are_unique() {
        let node = NodeBuilder::new("names@localhost").cookie("secret").finish();
        let _a = node.create_mailbox(Some("taken")).expect("first failed");
        assert!(matches!(
            node.create_mailbox(Some("taken")),
            Err(NodeError::NameInUse { .. })
        ));
        let b = node.create_mailbox(None).expect("anonymous failed");
        assert!(matches!(
            b.register(Some("taken")),
            Err(NodeError::NameInUse { .. })
        ));
        b.register(Some("other")).expect("register failed");
        assert_eq!(b.name().as_deref(), Some("other"));
        b.register(None).expect("clearing failed");
        assert_eq!(b.name(), None);
    }

    #[test]
    fn pids_are_never_reused() {
        let node = NodeBuilder::new("pids@localhost").cookie("secret").finish();
        let a = node.create_mailbox(None).expect("create failed");
        let first_pid = a.pid().clone();
        a.close();
        let b = node.create_mailbox(None).expect("create failed");
        assert_ne!(first_pid, *b.pid());
    }

    #[test]
    fn local_send_and_receive_round_trips() {
        let node = NodeBuilder::new("sendrecv@localhost").cookie("secret").finish();
        let a = node.create_mailbox(Some("echo")).expect("create failed");
        let b = node.create_mailbox(None).expect("create failed");

        b.send(a.pid(), Term::from(Atom::new("by_pid")));
        assert_eq!(a.receive().expect("receive failed"), Term::from(Atom::new("by_pid")));

        b.send_to_name("echo", node.name(), Term::from(Atom::new("by_name")));
        assert_eq!(
            a.receive().expect("receive failed"),
            Term::from(Atom::new("by_name"))
        );
    }

    #[test]
    fn receive_timeout_expires_without_consuming() {
        let node = NodeBuilder::new("timeouts@localhost").cookie("secret").finish();
        let a = node.create_mailbox(None).expect("create failed");
        assert_eq!(
            a.receive_timeout(Duration::from_millis(20)).expect("receive failed"),
            None
        );
        a.send(a.pid(), Term::from(Atom::new("late")));
        assert_eq!(
            a.receive_timeout(Duration::from_millis(20)).expect("receive failed"),
            Some(Term::from(Atom::new("late")))
        );
    }

    #[test]
    fn local_links_propagate_exits() {
        let node = NodeBuilder::new("links@localhost").cookie("secret").finish();
        let a = node.create_mailbox(None).expect("create failed");
        let b = node.create_mailbox(None).expect("create failed");

        a.link(b.pid()).expect("link failed");
        let a_pid = a.pid().clone();
        a.exit(Term::from(Atom::new("boom")));

        match b.receive() {
            Err(MailboxError::Exited { from, reason }) => {
                assert_eq!(from, a_pid);
                assert_eq!(reason, Term::from(Atom::new("boom")));
            }
            other => panic!("expected an exit, got {:?}", other),
        }
    }

    #[test]
    fn unlink_stops_exit_propagation() {
        let node = NodeBuilder::new("unlinks@localhost").cookie("secret").finish();
        let a = node.create_mailbox(None).expect("create failed");
        let b = node.create_mailbox(None).expect("create failed");

        a.link(b.pid()).expect("link failed");
        a.unlink(b.pid());
        a.exit(Term::from(Atom::new("boom")));

        assert_eq!(
            b.receive_timeout(Duration::from_millis(50)).expect("receive failed"),
            None
        );
    }

    #[test]
    fn send_exit_reaches_local_pids_without_links() {
        let node = NodeBuilder::new("exit2@localhost").cookie("secret").finish();
        let a = node.create_mailbox(None).expect("create failed");
        let b = node.create_mailbox(None).expect("create failed");

        a.send_exit(b.pid(), Term::from(Atom::new("kill")));
        match b.receive() {
            Err(MailboxError::Exited { from, reason }) => {
                assert_eq!(from, *a.pid());
                assert_eq!(reason, Term::from(Atom::new("kill")));
            }
            other => panic!("expected an exit, got {:?}", other),
        }
    }

    #[test]
    fn linking_to_a_dead_pid_raises_noproc() {
        let node = NodeBuilder::new("noproc@localhost").cookie("secret").finish();
        let a = node.create_mailbox(None).expect("create failed");
        let dead = Pid::new(node.name().to_string(), 77, 77, 0);
        match a.link(&dead) {
            Err(MailboxError::Exited { from, reason }) => {
                assert_eq!(from, dead);
                assert_eq!(reason, Term::from(Atom::new("noproc")));
            }
            other => panic!("expected noproc, got {:?}", other),
        }
    }
}
