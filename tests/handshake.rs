//! End-to-end scenarios driven entirely in-process via `Stack::pair`, no
//! TUN device required. Each test wires two stacks together over channels
//! and drives a real connect/accept/send/recv sequence through both sides
//! of the automaton.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use ustcp::{Config, Stack};

fn addrs() -> (Ipv4Addr, Ipv4Addr) {
    ("10.1.0.1".parse().unwrap(), "10.1.0.2".parse().unwrap())
}

#[test]
fn three_way_handshake_then_echo() {
    let (a_ip, b_ip) = addrs();
    let (client, server) = Stack::pair(a_ip, b_ip, Config::default());

    let listener = server.bind(7000).unwrap();
    let server_thread = thread::spawn(move || {
        let mut stream = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });

    let mut stream = client.connect(b_ip, 7000).unwrap();
    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    server_thread.join().unwrap();
}

#[test]
fn send_larger_than_one_window_arrives_whole() {
    let (a_ip, b_ip) = addrs();
    let mut config = Config::default();
    config.initial_window = 256;
    config.flush_interval = Duration::from_millis(5);
    let (client, server) = Stack::pair(a_ip, b_ip, config);

    let listener = server.bind(7001).unwrap();
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let server_thread = thread::spawn(move || {
        let mut stream = listener.accept().unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        while received.len() < expected.len() {
            let n = stream.read(&mut buf).unwrap();
            assert_ne!(n, 0, "peer closed before all bytes arrived");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
    });

    let mut stream = client.connect(b_ip, 7001).unwrap();
    stream.write_all(&payload).unwrap();
    stream.flush().unwrap();
    drop(stream);

    server_thread.join().unwrap();
}

#[test]
fn passive_close_yields_eof_to_reader() {
    let (a_ip, b_ip) = addrs();
    let (client, server) = Stack::pair(a_ip, b_ip, Config::default());

    let listener = server.bind(7002).unwrap();
    let server_thread = thread::spawn(move || {
        let mut stream = listener.accept().unwrap();
        stream.write_all(b"bye").unwrap();
        // Dropping here drives FinWait1 -> ... -> TimeWait on the server.
    });

    let mut stream = client.connect(b_ip, 7002).unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bye");

    // Once the server closes, a further read must report end-of-stream.
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    server_thread.join().unwrap();
}

#[test]
fn connect_to_unlistened_port_is_reset() {
    let (a_ip, b_ip) = addrs();
    let (client, _server) = Stack::pair(a_ip, b_ip, Config::default());

    let err = client.connect(b_ip, 9999).unwrap_err();
    assert!(matches!(err, ustcp::Error::ConnectionReset));
}

#[test]
fn listener_survives_multiple_sequential_clients() {
    let (a_ip, b_ip) = addrs();
    let (client, server) = Stack::pair(a_ip, b_ip, Config::default());

    let listener = server.bind(7003).unwrap();
    let server_thread = thread::spawn(move || {
        for _ in 0..2 {
            let mut stream = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(&buf[..n]).unwrap();
        }
    });

    for msg in [&b"one"[..], &b"two"[..]] {
        let mut stream = client.connect(b_ip, 7003).unwrap();
        stream.write_all(msg).unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], msg);
        drop(stream);
        // Give TIME-WAIT teardown a moment before the next connect reuses
        // the listener's accept queue.
        thread::sleep(Duration::from_millis(20));
    }

    server_thread.join().unwrap();
}
