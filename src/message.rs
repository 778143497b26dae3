//! Messages passed between connected nodes.
//!
//! Every non-tick frame on an established connection carries one control
//! tuple (optionally followed by a payload term) encoded in the External
//! Term Format. The first tuple element is the operation number; the
//! remaining elements depend on it. Among the operations this crate speaks
//! only a few distinct bodies exist: a `{From, To}` pid pair ([`PidPair`],
//! shared by `LINK`, `UNLINK` and `GROUP_LEADER`), an exit signal with a
//! reason ([`ExitSignal`], shared by `EXIT` and `EXIT2`) and the two
//! payload-carrying send forms ([`Send`] and [`RegSend`]). The trace token
//! operations wrap the same bodies with one extra tuple slot.
//!
//! Reference: [Protocol between Connected Nodes]
//! (https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html#protocol-between-connected-nodes)
use std::io::{Read, Write};

use crate::codec::DecodeError;
use crate::connection::{RecvError, SendError};
use crate::term::{Atom, FixInteger, List, Pid, Term, Tuple};

const OP_LINK: i32 = 1;
const OP_SEND: i32 = 2;
const OP_EXIT: i32 = 3;
const OP_UNLINK: i32 = 4;
const OP_REG_SEND: i32 = 6;
const OP_GROUP_LEADER: i32 = 7;
const OP_EXIT2: i32 = 8;
const OP_SEND_TT: i32 = 12;
const OP_EXIT_TT: i32 = 13;
const OP_REG_SEND_TT: i32 = 16;
const OP_EXIT2_TT: i32 = 18;

/// The `{From, To}` body shared by `LINK`, `UNLINK` and `GROUP_LEADER`.
#[derive(Debug, Clone, PartialEq)]
pub struct PidPair {
    /// The process the operation originates from.
    pub from_pid: Pid,

    /// The process the operation is aimed at.
    pub to_pid: Pid,
}

impl PidPair {
    fn read(mut fields: CtrlFields) -> Result<Self, DecodeError> {
        let from_pid = fields.pid()?;
        let to_pid = fields.pid()?;
        fields.finish()?;
        Ok(Self { from_pid, to_pid })
    }

    fn into_fields(self) -> Vec<Term> {
        vec![self.from_pid.into(), self.to_pid.into()]
    }
}

/// The body shared by the `EXIT` and `EXIT2` signals.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    /// The exiting (or exit-requesting) process.
    pub from_pid: Pid,

    /// The process the signal is delivered to.
    pub to_pid: Pid,

    /// The exit reason term.
    pub reason: Term,
}

impl ExitSignal {
    fn read(mut fields: CtrlFields) -> Result<Self, DecodeError> {
        let from_pid = fields.pid()?;
        let to_pid = fields.pid()?;
        let reason = fields.term()?;
        fields.finish()?;
        Ok(Self {
            from_pid,
            to_pid,
            reason,
        })
    }

    // The trace token sits between the pids and the reason on the wire.
    fn read_tt(mut fields: CtrlFields) -> Result<(Self, Term), DecodeError> {
        let from_pid = fields.pid()?;
        let to_pid = fields.pid()?;
        let trace_token = fields.term()?;
        let reason = fields.term()?;
        fields.finish()?;
        Ok((
            Self {
                from_pid,
                to_pid,
                reason,
            },
            trace_token,
        ))
    }

    fn into_fields(self, trace_token: Option<Term>) -> Vec<Term> {
        let mut fields: Vec<Term> = vec![self.from_pid.into(), self.to_pid.into()];
        if let Some(token) = trace_token {
            fields.push(token);
        }
        fields.push(self.reason);
        fields
    }
}

/// The `SEND` body: a payload addressed to a pid.
#[derive(Debug, Clone, PartialEq)]
pub struct Send {
    /// The sender's idea of the cookie.
    ///
    /// Connections check this once, on the first send after the handshake.
    pub cookie: Atom,

    /// The destination process.
    pub to_pid: Pid,

    /// The payload.
    pub message: Term,
}

/// The `REG_SEND` body: a payload addressed to a registered name.
#[derive(Debug, Clone, PartialEq)]
pub struct RegSend {
    /// The sending process.
    pub from_pid: Pid,

    /// The sender's idea of the cookie, as in [`Send`].
    pub cookie: Atom,

    /// The registered name the payload is for.
    pub to_name: Atom,

    /// The payload.
    pub message: Term,
}

/// Message.
///
/// This provides various message construction functions.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A zero length frame, i.e. the distribution keepalive.
    ///
    /// A receiver answers every tick with a tick of its own ("tock").
    Tick,

    /// `LINK`: adds a link between the two pids.
    Link(PidPair),

    /// `UNLINK`: drops the link between the two pids.
    Unlink(PidPair),

    /// `GROUP_LEADER`: received but otherwise ignored, this crate hosts no
    /// group leaders.
    GroupLeader(PidPair),

    /// `EXIT`: an exit signal that also consumes the link it travelled over.
    Exit(ExitSignal),

    /// `EXIT2` (the `exit/2` BIF): an exit signal that leaves links alone.
    Exit2(ExitSignal),

    /// `SEND`: a payload for a pid.
    Send(Send),

    /// `REG_SEND`: a payload for a registered name.
    RegSend(RegSend),

    /// `SEND_TT`: [`Message::Send`] plus a trace token.
    SendTt {
        /// The send body.
        send: Send,

        /// The trace token.
        trace_token: Term,
    },

    /// `REG_SEND_TT`: [`Message::RegSend`] plus a trace token.
    RegSendTt {
        /// The send body.
        reg_send: RegSend,

        /// The trace token.
        trace_token: Term,
    },

    /// `EXIT_TT`: [`Message::Exit`] plus a trace token.
    ExitTt {
        /// The signal body.
        exit: ExitSignal,

        /// The trace token.
        trace_token: Term,
    },

    /// `EXIT2_TT`: [`Message::Exit2`] plus a trace token.
    Exit2Tt {
        /// The signal body.
        exit: ExitSignal,

        /// The trace token.
        trace_token: Term,
    },
}

impl Message {
    /// Makes a `SEND` message.
    pub fn send(cookie: Atom, to_pid: Pid, message: Term) -> Self {
        Self::Send(Send {
            cookie,
            to_pid,
            message,
        })
    }

    /// Makes a `REG_SEND` message.
    pub fn reg_send(from_pid: Pid, cookie: Atom, to_name: Atom, message: Term) -> Self {
        Self::RegSend(RegSend {
            from_pid,
            cookie,
            to_name,
            message,
        })
    }

    /// Makes a `LINK` message.
    pub fn link(from_pid: Pid, to_pid: Pid) -> Self {
        Self::Link(PidPair { from_pid, to_pid })
    }

    /// Makes an `UNLINK` message.
    pub fn unlink(from_pid: Pid, to_pid: Pid) -> Self {
        Self::Unlink(PidPair { from_pid, to_pid })
    }

    /// Makes an `EXIT` message.
    pub fn exit(from_pid: Pid, to_pid: Pid, reason: Term) -> Self {
        Self::Exit(ExitSignal {
            from_pid,
            to_pid,
            reason,
        })
    }

    /// Makes an `EXIT2` message.
    pub fn exit2(from_pid: Pid, to_pid: Pid, reason: Term) -> Self {
        Self::Exit2(ExitSignal {
            from_pid,
            to_pid,
            reason,
        })
    }

    /// Strips the trace token from the `*_TT` message variants.
    ///
    /// Trace tokens are an observability feature this crate does not act on,
    /// so readers normalize messages before dispatching them.
    pub fn normalize(self) -> Self {
        match self {
            Self::SendTt { send, .. } => Self::Send(send),
            Self::RegSendTt { reg_send, .. } => Self::RegSend(reg_send),
            Self::ExitTt { exit, .. } => Self::Exit(exit),
            Self::Exit2Tt { exit, .. } => Self::Exit2(exit),
            other => other,
        }
    }

    /// Writes the control tuple (and payload, if any) of this message.
    pub fn write_into<W: Write>(self, writer: &mut W) -> Result<(), SendError> {
        match self {
            Self::Tick => Ok(()),
            Self::Link(pair) => write_ctrl(writer, OP_LINK, pair.into_fields(), None),
            Self::Unlink(pair) => write_ctrl(writer, OP_UNLINK, pair.into_fields(), None),
            Self::GroupLeader(pair) => {
                write_ctrl(writer, OP_GROUP_LEADER, pair.into_fields(), None)
            }
            Self::Exit(exit) => write_ctrl(writer, OP_EXIT, exit.into_fields(None), None),
            Self::Exit2(exit) => write_ctrl(writer, OP_EXIT2, exit.into_fields(None), None),
            Self::ExitTt { exit, trace_token } => {
                write_ctrl(writer, OP_EXIT_TT, exit.into_fields(Some(trace_token)), None)
            }
            Self::Exit2Tt { exit, trace_token } => {
                write_ctrl(writer, OP_EXIT2_TT, exit.into_fields(Some(trace_token)), None)
            }
            Self::Send(send) => write_ctrl(
                writer,
                OP_SEND,
                vec![send.cookie.into(), send.to_pid.into()],
                Some(send.message),
            ),
            Self::SendTt { send, trace_token } => write_ctrl(
                writer,
                OP_SEND_TT,
                vec![send.cookie.into(), send.to_pid.into(), trace_token],
                Some(send.message),
            ),
            Self::RegSend(reg_send) => write_ctrl(
                writer,
                OP_REG_SEND,
                vec![
                    reg_send.from_pid.into(),
                    reg_send.cookie.into(),
                    reg_send.to_name.into(),
                ],
                Some(reg_send.message),
            ),
            Self::RegSendTt {
                reg_send,
                trace_token,
            } => write_ctrl(
                writer,
                OP_REG_SEND_TT,
                vec![
                    reg_send.from_pid.into(),
                    reg_send.cookie.into(),
                    reg_send.to_name.into(),
                    trace_token,
                ],
                Some(reg_send.message),
            ),
        }
    }

    /// Reads one message (control tuple plus payload) from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, RecvError> {
        let mut ctrl = CtrlFields::decode(&mut *reader)?;
        let op = ctrl.operation()?;
        let message = match op {
            OP_LINK => Self::Link(PidPair::read(ctrl)?),
            OP_UNLINK => Self::Unlink(PidPair::read(ctrl)?),
            OP_GROUP_LEADER => Self::GroupLeader(PidPair::read(ctrl)?),
            OP_EXIT => Self::Exit(ExitSignal::read(ctrl)?),
            OP_EXIT2 => Self::Exit2(ExitSignal::read(ctrl)?),
            OP_EXIT_TT => {
                let (exit, trace_token) = ExitSignal::read_tt(ctrl)?;
                Self::ExitTt { exit, trace_token }
            }
            OP_EXIT2_TT => {
                let (exit, trace_token) = ExitSignal::read_tt(ctrl)?;
                Self::Exit2Tt { exit, trace_token }
            }
            OP_SEND => {
                let cookie = ctrl.atom()?;
                let to_pid = ctrl.pid()?;
                ctrl.finish()?;
                Self::Send(Send {
                    cookie,
                    to_pid,
                    message: Term::decode(&mut *reader)?,
                })
            }
            OP_SEND_TT => {
                let cookie = ctrl.atom()?;
                let to_pid = ctrl.pid()?;
                let trace_token = ctrl.term()?;
                ctrl.finish()?;
                Self::SendTt {
                    send: Send {
                        cookie,
                        to_pid,
                        message: Term::decode(&mut *reader)?,
                    },
                    trace_token,
                }
            }
            OP_REG_SEND => {
                let from_pid = ctrl.pid()?;
                let cookie = ctrl.atom()?;
                let to_name = ctrl.atom()?;
                ctrl.finish()?;
                Self::RegSend(RegSend {
                    from_pid,
                    cookie,
                    to_name,
                    message: Term::decode(&mut *reader)?,
                })
            }
            OP_REG_SEND_TT => {
                let from_pid = ctrl.pid()?;
                let cookie = ctrl.atom()?;
                let to_name = ctrl.atom()?;
                let trace_token = ctrl.term()?;
                ctrl.finish()?;
                Self::RegSendTt {
                    reg_send: RegSend {
                        from_pid,
                        cookie,
                        to_name,
                        message: Term::decode(&mut *reader)?,
                    },
                    trace_token,
                }
            }
            op => return Err(RecvError::UnsupportedOp { op }),
        };
        Ok(message)
    }
}

// Composes one control tuple `{Op, Fields...}` and the payload, if the
// operation carries one.
fn write_ctrl<W: Write>(
    writer: &mut W,
    op: i32,
    fields: Vec<Term>,
    payload: Option<Term>,
) -> Result<(), SendError> {
    let mut elements = Vec::with_capacity(1 + fields.len());
    elements.push(Term::from(FixInteger::from(op)));
    elements.extend(fields);
    Term::from(Tuple::from(elements)).encode(&mut *writer)?;
    if let Some(payload) = payload {
        payload.encode(writer)?;
    }
    Ok(())
}

// Cursor over the fields of a decoded control tuple. Consumed fields are
// taken out of the tuple; `finish` rejects tuples with leftovers so every
// operation gets an exact arity check for free.
#[derive(Debug)]
struct CtrlFields {
    tuple: Tuple,
    index: usize,
}

impl CtrlFields {
    fn decode<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let term = Term::decode(reader)?;
        let tuple: Tuple = term.try_into().map_err(|value| DecodeError::UnexpectedType {
            value,
            expected: "tuple".to_owned(),
        })?;
        Ok(Self { tuple, index: 0 })
    }

    fn operation(&mut self) -> Result<i32, DecodeError> {
        match self.term()? {
            Term::FixInteger(op) => Ok(op.value),
            value => Err(DecodeError::UnexpectedType {
                value,
                expected: "operation number".to_owned(),
            }),
        }
    }

    fn pid(&mut self) -> Result<Pid, DecodeError> {
        self.field("pid")
    }

    fn atom(&mut self) -> Result<Atom, DecodeError> {
        self.field("atom")
    }

    fn term(&mut self) -> Result<Term, DecodeError> {
        match self.tuple.elements.get_mut(self.index) {
            Some(slot) => {
                self.index += 1;
                Ok(std::mem::replace(slot, Term::from(List::nil())))
            }
            None => Err(self.wrong_arity("at least", self.index + 1)),
        }
    }

    fn field<T>(&mut self, expected: &str) -> Result<T, DecodeError>
    where
        Term: TryInto<T, Error = Term>,
    {
        self.term()?
            .try_into()
            .map_err(|value| DecodeError::UnexpectedType {
                value,
                expected: expected.to_owned(),
            })
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.index == self.tuple.elements.len() {
            Ok(())
        } else {
            Err(self.wrong_arity("exactly", self.index))
        }
    }

    fn wrong_arity(&self, bound: &str, count: usize) -> DecodeError {
        DecodeError::UnexpectedType {
            value: self.tuple.clone().into(),
            expected: format!("a control tuple with {} {} elements", bound, count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Str;

    fn pid(id: u32) -> Pid {
        Pid::new("test@localhost", id, 0, 1)
    }

    fn round_trip(message: Message) -> Message {
        let mut buf = Vec::new();
        message.write_into(&mut buf).expect("write failed");
        Message::read_from(&mut buf.as_slice()).expect("read failed")
    }

    #[test]
    fn send_round_trips() {
        let message = Message::send(
            Atom::new(""),
            pid(1),
            Term::from(Str::from("payload")),
        );
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn reg_send_round_trips() {
        let message = Message::reg_send(
            pid(1),
            Atom::new(""),
            Atom::new("net_kernel"),
            Term::from(Atom::new("hello")),
        );
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn pid_pair_and_exit_messages_round_trip() {
        for message in [
            Message::link(pid(1), pid(2)),
            Message::unlink(pid(1), pid(2)),
            Message::GroupLeader(PidPair {
                from_pid: pid(1),
                to_pid: pid(2),
            }),
            Message::exit(pid(1), pid(2), Term::from(Atom::new("normal"))),
            Message::exit2(pid(1), pid(2), Term::from(Atom::new("kill"))),
        ] {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn trace_token_variants_normalize_to_their_base_forms() {
        let token = Term::from(Atom::new("token"));
        let message = Message::SendTt {
            send: Send {
                cookie: Atom::new(""),
                to_pid: pid(3),
                message: Term::from(Atom::new("m")),
            },
            trace_token: token.clone(),
        };
        assert_eq!(
            round_trip(message).normalize(),
            Message::send(Atom::new(""), pid(3), Term::from(Atom::new("m")))
        );

        let message = Message::Exit2Tt {
            exit: ExitSignal {
                from_pid: pid(1),
                to_pid: pid(2),
                reason: Term::from(Atom::new("r")),
            },
            trace_token: token,
        };
        assert_eq!(
            round_trip(message).normalize(),
            Message::exit2(pid(1), pid(2), Term::from(Atom::new("r")))
        );
    }

    #[test]
    fn exit_tt_keeps_the_token_between_pids_and_reason() {
        let message = Message::ExitTt {
            exit: ExitSignal {
                from_pid: pid(1),
                to_pid: pid(2),
                reason: Term::from(Atom::new("why")),
            },
            trace_token: Term::from(Atom::new("token")),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn unsupported_ops_are_reported() {
        let mut buf = Vec::new();
        write_ctrl(
            &mut buf,
            19,
            vec![Term::from(pid(1)), Term::from(pid(2))],
            None,
        )
        .expect("write failed");
        assert!(matches!(
            Message::read_from(&mut buf.as_slice()),
            Err(RecvError::UnsupportedOp { op: 19 })
        ));
    }

    #[test]
    fn wrong_control_tuple_arities_are_rejected() {
        // A LINK with a third pid must not parse.
        let mut buf = Vec::new();
        write_ctrl(
            &mut buf,
            OP_LINK,
            vec![Term::from(pid(1)), Term::from(pid(2)), Term::from(pid(3))],
            None,
        )
        .expect("write failed");
        assert!(matches!(
            Message::read_from(&mut buf.as_slice()),
            Err(RecvError::Decode(_))
        ));

        // An EXIT missing its reason must not parse either.
        let mut buf = Vec::new();
        write_ctrl(
            &mut buf,
            OP_EXIT,
            vec![Term::from(pid(1)), Term::from(pid(2))],
            None,
        )
        .expect("write failed");
        assert!(matches!(
            Message::read_from(&mut buf.as_slice()),
            Err(RecvError::Decode(_))
        ));
    }
}
