//! End-to-end tests: real nodes talking over loopback TCP, published in an
//! embedded EPMD server.
use std::time::Duration;

use erl_node::epmd::EpmdServer;
use erl_node::mailbox::MailboxError;
use erl_node::node::{Node, NodeBuilder};
use erl_node::term::{Atom, Pid, Term, Tuple};

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn start_node(epmd: &EpmdServer, name: &str) -> Node {
    let node = NodeBuilder::new(name)
        .cookie("loopback-cookie")
        .epmd_port(epmd.port())
        .finish();
    node.listen(0).expect("failed to listen");
    node
}

fn atom(name: &str) -> Term {
    Term::from(Atom::new(name))
}

#[test]
fn loopback_ping_works_both_ways() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let ping = start_node(&epmd, "ping@localhost");
    let pong = start_node(&epmd, "pong@localhost");

    assert!(ping.ping("pong@localhost", PING_TIMEOUT));
    assert!(pong.ping("ping@localhost", PING_TIMEOUT));

    // Both nodes are published.
    let mut names: Vec<String> = ping
        .names()
        .expect("failed to list names")
        .into_iter()
        .map(|(name, _port)| name)
        .collect();
    names.sort();
    assert_eq!(names, ["ping", "pong"]);

    ping.stop();
    pong.stop();
}

#[test]
fn ping_with_a_wrong_cookie_fails() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let server = start_node(&epmd, "honest@localhost");

    let intruder = NodeBuilder::new("intruder@localhost")
        .cookie("wrong-cookie")
        .epmd_port(epmd.port())
        .finish();
    intruder.listen(0).expect("failed to listen");

    assert!(!intruder.ping("honest@localhost", Duration::from_secs(5)));

    server.stop();
    intruder.stop();
}

#[test]
fn ping_to_an_unregistered_node_fails_fast() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let node = start_node(&epmd, "lonely@localhost");
    assert!(!node.ping("nosuch@localhost", Duration::from_secs(5)));
    node.stop();
}

#[test]
fn registered_names_receive_messages_and_can_reply() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let a = start_node(&epmd, "req@localhost");
    let b = start_node(&epmd, "rep@localhost");

    let echo = b.create_mailbox(Some("echo")).expect("failed to create echo");
    let client = a.create_mailbox(None).expect("failed to create client");

    let request = Term::from(Tuple::from(vec![
        Term::from(client.pid().clone()),
        atom("hello"),
    ]));
    client.send_to_name("echo", b.name(), request);

    // The echo mailbox answers to the pid embedded in the request, reusing
    // the same duplex connection in the other direction.
    let received = echo
        .receive_timeout(RECV_TIMEOUT)
        .expect("receive failed")
        .expect("timed out");
    let tuple: Tuple = received.try_into().expect("not a tuple");
    let reply_to: Pid = tuple.elements[0].clone().try_into().expect("not a pid");
    assert_eq!(tuple.elements[1], atom("hello"));
    echo.send(&reply_to, atom("hello_back"));

    let reply = client
        .receive_timeout(RECV_TIMEOUT)
        .expect("receive failed")
        .expect("timed out");
    assert_eq!(reply, atom("hello_back"));

    a.stop();
    b.stop();
}

#[test]
fn messages_from_one_sender_arrive_in_order() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let a = start_node(&epmd, "orderly@localhost");
    let b = start_node(&epmd, "sink@localhost");

    let sink = b.create_mailbox(Some("sink")).expect("failed to create sink");
    let sender = a.create_mailbox(None).expect("failed to create sender");

    for i in 0..100 {
        sender.send_to_name(
            "sink",
            b.name(),
            Term::from(erl_node::term::FixInteger::from(i)),
        );
    }
    for i in 0..100 {
        let received = sink
            .receive_timeout(RECV_TIMEOUT)
            .expect("receive failed")
            .expect("timed out");
        assert_eq!(received, Term::from(erl_node::term::FixInteger::from(i)));
    }

    a.stop();
    b.stop();
}

#[test]
fn links_break_with_noconnection_when_the_peer_goes_down() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let a = start_node(&epmd, "watcher@localhost");
    let b = start_node(&epmd, "flaky@localhost");

    let watcher = a.create_mailbox(None).expect("failed to create watcher");
    let target = b.create_mailbox(Some("target")).expect("failed to create target");
    let target_pid = target.pid().clone();

    // Make sure the connection exists, then link across it.
    assert!(a.ping("flaky@localhost", PING_TIMEOUT));
    watcher.link(&target_pid).expect("link failed");

    // Taking the whole peer node down, link intact, must break it with
    // noconnection on the surviving side.
    b.stop();

    match watcher.receive_timeout(RECV_TIMEOUT) {
        Err(MailboxError::Exited { from, reason }) => {
            assert_eq!(from, target_pid);
            assert_eq!(reason, atom("noconnection"));
        }
        other => panic!("expected a noconnection exit, got {:?}", other),
    }

    a.stop();
}

#[test]
fn remote_exit_signals_reach_linked_mailboxes() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let a = start_node(&epmd, "exiter@localhost");
    let b = start_node(&epmd, "exitee@localhost");

    let left = a.create_mailbox(None).expect("failed to create left");
    let right = b.create_mailbox(Some("right")).expect("failed to create right");
    let right_pid = right.pid().clone();

    assert!(a.ping("exitee@localhost", PING_TIMEOUT));
    left.link(&right_pid).expect("link failed");
    let left_pid = left.pid().clone();

    // Closing the mailbox sends EXIT over the wire to every linked pid.
    left.exit(atom("goodbye"));

    match right.receive_timeout(RECV_TIMEOUT) {
        Err(MailboxError::Exited { from, reason }) => {
            assert_eq!(from, left_pid);
            assert_eq!(reason, atom("goodbye"));
        }
        other => panic!("expected an exit, got {:?}", other),
    }

    a.stop();
    b.stop();
}

#[test]
fn send_exit_delivers_an_exit2_signal() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let a = start_node(&epmd, "killer@localhost");
    let b = start_node(&epmd, "victim@localhost");

    let killer = a.create_mailbox(None).expect("failed to create killer");
    let victim = b.create_mailbox(Some("victim")).expect("failed to create victim");
    let killer_pid = killer.pid().clone();

    assert!(a.ping("victim@localhost", PING_TIMEOUT));
    killer.send_exit(victim.pid(), atom("kill"));

    match victim.receive_timeout(RECV_TIMEOUT) {
        Err(MailboxError::Exited { from, reason }) => {
            assert_eq!(from, killer_pid);
            assert_eq!(reason, atom("kill"));
        }
        other => panic!("expected an exit, got {:?}", other),
    }

    a.stop();
    b.stop();
}

#[test]
fn sends_by_pid_cross_nodes() {
    let epmd = EpmdServer::start(0).expect("failed to start EPMD");
    let a = start_node(&epmd, "pidsend@localhost");
    let b = start_node(&epmd, "pidrecv@localhost");

    let receiver = b.create_mailbox(None).expect("failed to create receiver");
    let sender = a.create_mailbox(None).expect("failed to create sender");

    // The receiver is anonymous: its pid travels to the peer in a term.
    let registry = b.create_mailbox(Some("registry")).expect("failed to create registry");
    assert!(a.ping("pidrecv@localhost", PING_TIMEOUT));
    sender.send_to_name("registry", b.name(), atom("who_is_there"));
    assert_eq!(
        registry
            .receive_timeout(RECV_TIMEOUT)
            .expect("receive failed")
            .expect("timed out"),
        atom("who_is_there")
    );

    sender.send(receiver.pid(), atom("direct"));
    assert_eq!(
        receiver
            .receive_timeout(RECV_TIMEOUT)
            .expect("receive failed")
            .expect("timed out"),
        atom("direct")
    );

    a.stop();
    b.stop();
}
