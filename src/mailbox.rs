//! Mailboxes, the local process model.
//!
//! A [`Mailbox`] is the sending and receiving endpoint a user of this crate
//! holds. It is addressable by its pid and, optionally, by a registered name,
//! both from this process and from every connected node. Receiving blocks on
//! a FIFO queue; exit signals arriving over a link surface as
//! [`MailboxError::Exited`].
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::message::Message;
use crate::node::{NodeCore, NodeError, NodeName};
use crate::term::{Atom, Pid, Term};

/// Errors surfaced by mailbox operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MailboxError {
    /// An exit signal terminated the interaction.
    ///
    /// Raised by `receive` when an `EXIT`/`EXIT2` signal is at the head of
    /// the queue, and by `link` when the target process does not exist or
    /// cannot be reached (with reason `noproc`).
    #[error("exit signal from {from}: {reason}")]
    Exited {
        /// The pid the signal originated from.
        from: Pid,

        /// The exit reason term.
        reason: Term,
    },

    /// The mailbox was closed.
    #[error("the mailbox is closed")]
    Closed,
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Term),
    Exit { from: Pid, reason: Term },
}

#[derive(Debug)]
pub(crate) struct MailboxCore {
    pid: Pid,
    name: Mutex<Option<String>>,
    queue: Mutex<VecDeque<Delivery>>,
    available: Condvar,
    links: Mutex<HashSet<Pid>>,
    closed: AtomicBool,
}

impl MailboxCore {
    pub(crate) fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            links: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn pid(&self) -> &Pid {
        &self.pid
    }

    pub(crate) fn registered_name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    pub(crate) fn set_registered_name(&self, name: Option<String>) {
        *lock(&self.name) = name;
    }

    pub(crate) fn deliver_message(&self, message: Term) {
        self.push(Delivery::Message(message));
    }

    /// Delivers an exit signal.
    ///
    /// `remove_link` distinguishes `EXIT` (which consumes the link) from
    /// `EXIT2` and link breaks where the link is already gone. The link set
    /// is updated before the signal is queued so that a subsequent receive
    /// observes consistent membership.
    pub(crate) fn deliver_exit(&self, from: Pid, reason: Term, remove_link: bool) {
        if remove_link {
            lock(&self.links).remove(&from);
        }
        self.push(Delivery::Exit { from, reason });
    }

    pub(crate) fn add_link(&self, pid: Pid) {
        lock(&self.links).insert(pid);
    }

    pub(crate) fn remove_link(&self, pid: &Pid) {
        lock(&self.links).remove(pid);
    }

    #[cfg(test)]
    pub(crate) fn has_link(&self, pid: &Pid) -> bool {
        lock(&self.links).contains(pid)
    }

    pub(crate) fn take_links(&self) -> Vec<Pid> {
        lock(&self.links).drain().collect()
    }

    pub(crate) fn take_links_for_node(&self, node_name: &str) -> Vec<Pid> {
        let mut links = lock(&self.links);
        let broken: Vec<Pid> = links
            .iter()
            .filter(|pid| pid.node.name == node_name)
            .cloned()
            .collect();
        for pid in &broken {
            links.remove(pid);
        }
        broken
    }

    /// Marks the mailbox closed and wakes every blocked receiver.
    pub(crate) fn force_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }

    fn push(&self, delivery: Delivery) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        lock(&self.queue).push_back(delivery);
        self.available.notify_one();
    }
}

/// A mailbox hosted by a [`Node`](crate::node::Node).
///
/// Dropping the mailbox closes it with reason `normal`, propagating exit
/// signals along its links and unregistering it from the node.
#[derive(Debug)]
pub struct Mailbox {
    core: Arc<MailboxCore>,
    node: Arc<NodeCore>,
}

impl Mailbox {
    pub(crate) fn from_parts(core: Arc<MailboxCore>, node: Arc<NodeCore>) -> Self {
        Self { core, node }
    }

    /// The pid of this mailbox.
    pub fn pid(&self) -> &Pid {
        self.core.pid()
    }

    /// The currently registered name, if any.
    pub fn name(&self) -> Option<String> {
        self.core.registered_name()
    }

    /// Registers or clears the name of this mailbox.
    ///
    /// Passing `Some(name)` fails with [`NodeError::NameInUse`] when another
    /// mailbox holds the name; passing `None` always succeeds.
    pub fn register(&self, name: Option<&str>) -> Result<(), NodeError> {
        match name {
            Some(name) => self.node.register_name(&self.core, name),
            None => {
                self.node.clear_name(&self.core);
                Ok(())
            }
        }
    }

    /// Sends `message` to the process identified by `to`.
    ///
    /// Best-effort: a failure to reach the peer node is logged and swallowed.
    pub fn send(&self, to: &Pid, message: Term) {
        if let Err(e) = self.try_send(to, message) {
            log::warn!("failed to send a message to {}: {}", to, e);
        }
    }

    pub(crate) fn try_send(&self, to: &Pid, message: Term) -> Result<(), NodeError> {
        if self.node.is_local(&to.node.name) {
            // A vanished local pid is indistinguishable from a dead process;
            // the message is dropped like Erlang drops it.
            if let Some(mailbox) = self.node.lookup_pid(to) {
                mailbox.deliver_message(message);
            }
            return Ok(());
        }
        let conn = self.node.get_connection_to(&to.node.name)?;
        conn.send_message(Message::send(conn.outgoing_cookie(), to.clone(), message))?;
        Ok(())
    }

    /// Sends `message` to the mailbox registered as `name` on `node`.
    ///
    /// Best-effort, like [`Mailbox::send`].
    pub fn send_to_name(&self, name: &str, node: &NodeName, message: Term) {
        if let Err(e) = self.try_send_to_name(name, node, message) {
            log::warn!("failed to send a message to {}@{}: {}", name, node, e);
        }
    }

    pub(crate) fn try_send_to_name(
        &self,
        name: &str,
        node: &NodeName,
        message: Term,
    ) -> Result<(), NodeError> {
        let node_name = node.to_string();
        if self.node.is_local(&node_name) {
            if let Some(mailbox) = self.node.lookup_name(name) {
                mailbox.deliver_message(message);
            }
            return Ok(());
        }
        let conn = self.node.get_connection_to(&node_name)?;
        conn.send_message(Message::reg_send(
            self.pid().clone(),
            conn.outgoing_cookie(),
            Atom::new(name),
            message,
        ))?;
        Ok(())
    }

    /// Blocks until the next message arrives and returns it.
    ///
    /// An exit signal at the head of the queue is raised as
    /// [`MailboxError::Exited`] instead.
    pub fn receive(&self) -> Result<Term, MailboxError> {
        match self.recv(None)? {
            Some(term) => Ok(term),
            // Unreachable: without a deadline `recv` only returns a message
            // or an error.
            None => Err(MailboxError::Closed),
        }
    }

    /// Like [`Mailbox::receive`], but gives up after `timeout`.
    ///
    /// Returns `Ok(None)` on expiry without consuming anything.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Term>, MailboxError> {
        self.recv(Some(Instant::now() + timeout))
    }

    fn recv(&self, deadline: Option<Instant>) -> Result<Option<Term>, MailboxError> {
        let mut queue = lock(&self.core.queue);
        loop {
            if let Some(delivery) = queue.pop_front() {
                return match delivery {
                    Delivery::Message(term) => Ok(Some(term)),
                    Delivery::Exit { from, reason } => Err(MailboxError::Exited { from, reason }),
                };
            }
            if self.core.closed.load(Ordering::SeqCst) {
                return Err(MailboxError::Closed);
            }
            queue = match deadline {
                None => self
                    .core
                    .available
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.core
                        .available
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Links this mailbox to `pid`.
    ///
    /// Linking is idempotent. When the target does not exist locally or no
    /// connection to its node can be established, this fails with
    /// [`MailboxError::Exited`] carrying reason `noproc`.
    pub fn link(&self, pid: &Pid) -> Result<(), MailboxError> {
        if *pid == *self.pid() {
            return Ok(());
        }
        if self.node.is_local(&pid.node.name) {
            match self.node.lookup_pid(pid) {
                Some(target) => {
                    target.add_link(self.pid().clone());
                    self.core.add_link(pid.clone());
                    Ok(())
                }
                None => Err(noproc(pid)),
            }
        } else {
            let conn = self
                .node
                .get_connection_to(&pid.node.name)
                .map_err(|_| noproc(pid))?;
            conn.send_message(Message::link(self.pid().clone(), pid.clone()))
                .map_err(|_| noproc(pid))?;
            self.core.add_link(pid.clone());
            Ok(())
        }
    }

    /// Removes the link to `pid`, if any.
    ///
    /// Idempotent and best-effort: a failure to notify the peer node only
    /// leaves a stale remote link behind.
    pub fn unlink(&self, pid: &Pid) {
        self.core.remove_link(pid);
        if self.node.is_local(&pid.node.name) {
            if let Some(target) = self.node.lookup_pid(pid) {
                target.remove_link(self.pid());
            }
        } else if let Some(conn) = self.node.existing_connection(&pid.node.name) {
            if let Err(e) = conn.send_message(Message::unlink(self.pid().clone(), pid.clone())) {
                log::warn!("failed to send an unlink to {}: {}", pid, e);
            }
        }
    }

    /// Sends an `EXIT2` signal (the `exit/2` BIF) to `to`.
    ///
    /// Best-effort; the receiving side's links are left untouched.
    pub fn send_exit(&self, to: &Pid, reason: Term) {
        if self.node.is_local(&to.node.name) {
            if let Some(target) = self.node.lookup_pid(to) {
                target.deliver_exit(self.pid().clone(), reason, false);
            }
            return;
        }
        match self.node.get_connection_to(&to.node.name) {
            Ok(conn) => {
                if let Err(e) =
                    conn.send_message(Message::exit2(self.pid().clone(), to.clone(), reason))
                {
                    log::warn!("failed to send an exit signal to {}: {}", to, e);
                }
            }
            Err(e) => log::warn!("failed to send an exit signal to {}: {}", to, e),
        }
    }

    /// Closes this mailbox with the given exit reason, propagating it along
    /// every link.
    pub fn exit(self, reason: Term) {
        self.close_with(reason);
    }

    /// Closes this mailbox with reason `normal`.
    pub fn close(self) {
        self.close_with(Term::from(Atom::new("normal")));
    }

    fn close_with(&self, reason: Term) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.node.unregister_mailbox(&self.core);

        for linked in self.core.take_links() {
            if self.node.is_local(&linked.node.name) {
                if let Some(target) = self.node.lookup_pid(&linked) {
                    target.deliver_exit(self.pid().clone(), reason.clone(), true);
                }
            } else if let Some(conn) = self.node.existing_connection(&linked.node.name) {
                if let Err(e) = conn.send_message(Message::exit(
                    self.pid().clone(),
                    linked.clone(),
                    reason.clone(),
                )) {
                    log::warn!("failed to propagate an exit to {}: {}", linked, e);
                }
            }
        }
        self.core.available.notify_all();
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close_with(Term::from(Atom::new("normal")));
    }
}

fn noproc(pid: &Pid) -> MailboxError {
    MailboxError::Exited {
        from: pid.clone(),
        reason: Term::from(Atom::new("noproc")),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: u32) -> Pid {
        Pid::new("test@localhost", id, 0, 1)
    }

    #[test]
    fn deliveries_stay_fifo() {
        let core = MailboxCore::new(pid(1));
        for i in 0..3 {
            core.deliver_message(Term::from(crate::term::FixInteger::from(i)));
        }
        let mut queue = lock(&core.queue);
        for i in 0..3 {
            match queue.pop_front() {
                Some(Delivery::Message(term)) => {
                    assert_eq!(term, Term::from(crate::term::FixInteger::from(i)));
                }
                other => panic!("unexpected delivery {:?}", other),
            }
        }
    }

    #[test]
    fn link_set_membership_is_idempotent() {
        let core = MailboxCore::new(pid(1));
        core.add_link(pid(2));
        core.add_link(pid(2));
        assert!(core.has_link(&pid(2)));

        core.remove_link(&pid(2));
        assert!(!core.has_link(&pid(2)));
        core.remove_link(&pid(2));
    }

    #[test]
    fn exit_delivery_updates_the_link_set_first() {
        let core = MailboxCore::new(pid(1));
        core.add_link(pid(2));
        core.deliver_exit(pid(2), Term::from(Atom::new("bye")), true);
        assert!(!core.has_link(&pid(2)));
        assert!(matches!(
            lock(&core.queue).pop_front(),
            Some(Delivery::Exit { .. })
        ));
    }

    #[test]
    fn take_links_for_node_only_breaks_that_node() {
        let core = MailboxCore::new(pid(1));
        core.add_link(Pid::new("a@host", 1, 0, 0));
        core.add_link(Pid::new("a@host", 2, 0, 0));
        core.add_link(Pid::new("b@host", 3, 0, 0));

        let broken = core.take_links_for_node("a@host");
        assert_eq!(broken.len(), 2);
        assert!(core.has_link(&Pid::new("b@host", 3, 0, 0)));
    }

    #[test]
    fn closed_mailboxes_drop_deliveries() {
        let core = MailboxCore::new(pid(1));
        core.force_close();
        core.deliver_message(Term::from(Atom::new("late")));
        assert!(lock(&core.queue).is_empty());
    }
}
