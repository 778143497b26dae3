//! The duplex channel to one connected peer node.
//!
//! A [`Connection`] owns the writer half of an established (handshaken)
//! stream: all send paths compose their frame in a scratch buffer, poke the
//! length in afterwards and write it out under the connection's output lock.
//! The matching [`Receiver`] reads one length-prefixed frame at a time; the
//! node runtime drives it on a dedicated reader thread.
use byteorder::{BigEndian, ByteOrder as _};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::codec::{DecodeError, EncodeError};
use crate::handshake::PeerNode;
use crate::message::Message;
use crate::node::NodeName;
use crate::term::Atom;

const PASS_THROUGH: u8 = 0x70;

/// Possible errors while sending messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    /// The connection is already closed.
    #[error("the connection is closed")]
    NotConnected,

    /// Encode error.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Possible errors while receiving messages.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RecvError {
    /// Connection was closed by the peer.
    #[error("connection was closed by the peer")]
    Closed,

    /// Unsupported distributed operation.
    #[error("unsupported distributed operation {op}")]
    UnsupportedOp {
        /// The operation number.
        op: i32,
    },

    /// Unexpected frame type tag.
    #[error("expected frame type tag {PASS_THROUGH} but got {tag}")]
    UnexpectedTypeTag {
        /// The tag byte actually received.
        tag: u8,
    },

    /// Decode error.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The writer half and shared state of one established connection.
#[derive(Debug)]
pub struct Connection {
    local_name: NodeName,
    peer: PeerNode,
    cookie: String,
    send_cookie: bool,
    trace_level: u8,
    writer: Mutex<TcpStream>,
    connected: AtomicBool,
    cookie_verified: AtomicBool,
}

impl Connection {
    /// Wraps an already handshaken stream into a connection.
    ///
    /// Returns the connection together with the [`Receiver`] owning the read
    /// half of the stream.
    pub fn new(
        stream: TcpStream,
        local_name: NodeName,
        peer: PeerNode,
        cookie: &str,
        send_cookie: bool,
        trace_level: u8,
    ) -> std::io::Result<(Self, Receiver)> {
        let reader = stream.try_clone()?;
        Ok((
            Self {
                local_name,
                peer,
                cookie: cookie.to_owned(),
                send_cookie,
                trace_level,
                writer: Mutex::new(stream),
                connected: AtomicBool::new(true),
                cookie_verified: AtomicBool::new(false),
            },
            Receiver { stream: reader },
        ))
    }

    /// The peer on the other end of this connection.
    pub fn peer(&self) -> &PeerNode {
        &self.peer
    }

    /// The name of the local node.
    pub fn local_name(&self) -> &NodeName {
        &self.local_name
    }

    /// Returns `false` once the connection has been closed by either side.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the first inbound send already passed the cookie check.
    pub fn cookie_verified(&self) -> bool {
        self.cookie_verified.load(Ordering::SeqCst)
    }

    /// Marks the cookie check as passed.
    pub fn set_cookie_verified(&self) {
        self.cookie_verified.store(true, Ordering::SeqCst);
    }

    /// The cookie atom inbound sends must carry until verified.
    pub fn expected_cookie(&self) -> &str {
        if self.send_cookie {
            &self.cookie
        } else {
            ""
        }
    }

    /// The cookie atom to put into outgoing send messages.
    pub fn outgoing_cookie(&self) -> Atom {
        Atom::new(self.expected_cookie())
    }

    /// Sends one message to the peer.
    ///
    /// [`Message::Tick`] is transmitted as a zero length frame; everything
    /// else as a pass-through frame holding the control tuple and payload.
    pub fn send_message(&self, message: Message) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        if matches!(message, Message::Tick) {
            let mut writer = lock(&self.writer);
            writer.write_all(&[0; 4])?;
            writer.flush()?;
            return Ok(());
        }

        if self.trace_level > 0 {
            log::trace!("send to {}: {:?}", self.peer.name, message);
        }

        // Four reserved length bytes, then the frame body.
        let mut buf = vec![0, 0, 0, 0, PASS_THROUGH];
        message.write_into(&mut buf)?;
        let body_len = (buf.len() - 4) as u32;
        BigEndian::write_u32(&mut buf[..4], body_len);

        let mut writer = lock(&self.writer);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Closes this connection.
    ///
    /// The socket is shut down exactly once; a blocked reader wakes up with
    /// an error and runs its termination path.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let writer = lock(&self.writer);
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The reader half of one established connection.
#[derive(Debug)]
pub struct Receiver {
    stream: TcpStream,
}

impl Receiver {
    /// Receives one message.
    ///
    /// A clean close by the peer (EOF between frames) is reported as
    /// [`RecvError::Closed`]; EOF in the middle of a frame is an I/O error.
    pub fn recv(&mut self) -> Result<Message, RecvError> {
        let mut len_buf = [0; 4];
        if let Err(e) = self.stream.read_exact(&mut len_buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(RecvError::Closed);
            }
            return Err(e.into());
        }
        let size = BigEndian::read_u32(&len_buf) as usize;
        if size == 0 {
            return Ok(Message::Tick);
        }

        let mut buf = Vec::new();
        (&mut self.stream).take(size as u64).read_to_end(&mut buf)?;
        if buf.len() != size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "eof in the middle of a frame",
            )
            .into());
        }

        let tag = buf[0];
        if tag != PASS_THROUGH {
            return Err(RecvError::UnexpectedTypeTag { tag });
        }
        Message::read_from(&mut &buf[1..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::DistributionFlags;
    use crate::term::{Pid, Term};
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let a = TcpStream::connect(addr).expect("connect failed");
        let (b, _) = listener.accept().expect("accept failed");
        (a, b)
    }

    fn connection(stream: TcpStream) -> (Connection, Receiver) {
        let peer = PeerNode {
            name: "peer@localhost".parse().expect("bad name"),
            flags: DistributionFlags::new(),
            creation: None,
        };
        Connection::new(
            stream,
            "local@localhost".parse().expect("bad name"),
            peer,
            "cookie",
            false,
            0,
        )
        .expect("failed to wrap stream")
    }

    #[test]
    fn tick_is_a_zero_length_frame() {
        let (a, mut b) = connected_pair();
        let (conn, _rx) = connection(a);
        conn.send_message(Message::Tick).expect("send failed");

        let mut buf = [0xFF; 4];
        b.read_exact(&mut buf).expect("read failed");
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn zero_length_frames_decode_as_ticks() {
        let (a, mut b) = connected_pair();
        let (_conn, mut rx) = connection(a);
        b.write_all(&[0; 4]).expect("write failed");
        assert_eq!(rx.recv().expect("recv failed"), Message::Tick);
    }

    #[test]
    fn messages_travel_framed_end_to_end() {
        let (a, b) = connected_pair();
        let (conn, _rx_a) = connection(a);
        let (_conn_b, mut rx) = connection(b);

        let message = Message::send(
            Atom::new(""),
            Pid::new("peer@localhost", 1, 0, 0),
            Term::from(Atom::new("hello")),
        );
        conn.send_message(message.clone()).expect("send failed");
        assert_eq!(rx.recv().expect("recv failed"), message);
    }

    #[test]
    fn peer_close_is_reported_cleanly() {
        let (a, b) = connected_pair();
        let (_conn, mut rx) = connection(a);
        std::mem::drop(b);
        assert!(matches!(rx.recv(), Err(RecvError::Closed)));
    }

    #[test]
    fn send_after_close_fails_fast() {
        let (a, _b) = connected_pair();
        let (conn, _rx) = connection(a);
        conn.close();
        assert!(matches!(
            conn.send_message(Message::Tick),
            Err(SendError::NotConnected)
        ));
    }
}
