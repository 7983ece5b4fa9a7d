use std::{
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use gsrelay::{Config, Relay};
use gsrelay_transport::tcp::TcpGs;

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

fn start_relay(cfg: Config) -> thread::JoinHandle<i32> {
    let transport = TcpGs::new(cfg.rendezvous);
    let mut relay = Relay::new(cfg, transport).expect("relay setup failed");
    thread::spawn(move || relay.run())
}

fn connect_retry(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                return stream;
            }
            Err(_) => {
                assert!(Instant::now() < deadline, "could not connect to {addr}");
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn socks_pair(rendezvous: SocketAddr, local_port: u16) {
    let mut server = Config::server(rendezvous);
    server.socks = true;
    server.multi_peer = true;
    let _server = start_relay(server);

    let mut client = Config::client(rendezvous);
    client.port = local_port;
    client.multi_peer = true;
    let _client = start_relay(client);
}

#[test]
fn socks5_connect_proxies_bytes() {
    let destination = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst_port = destination.local_addr().unwrap().port();
    let dest = thread::spawn(move || {
        let (mut conn, _) = destination.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").unwrap();
    });

    let rendezvous = loopback(free_port());
    let local_port = free_port();
    socks_pair(rendezvous, local_port);

    let mut conn = connect_retry(loopback(local_port));

    // greeting: version 5, one method, no-auth
    conn.write_all(&[5, 1, 0]).unwrap();
    // request: CONNECT 127.0.0.1:dst_port
    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&dst_port.to_be_bytes());
    conn.write_all(&request).unwrap();

    let mut method = [0u8; 2];
    conn.read_exact(&mut method).unwrap();
    assert_eq!(method, [5, 0]);

    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[..4], &[5, 0, 0, 1]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), dst_port);

    conn.write_all(b"ping").unwrap();
    let mut answer = [0u8; 4];
    conn.read_exact(&mut answer).unwrap();
    assert_eq!(&answer, b"pong");

    dest.join().unwrap();
}

#[test]
fn socks4_connect_proxies_bytes() {
    let destination = TcpListener::bind("127.0.0.1:0").unwrap();
    let dst_port = destination.local_addr().unwrap().port();
    let dest = thread::spawn(move || {
        let (mut conn, _) = destination.accept().unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        conn.write_all(b"yo").unwrap();
    });

    let rendezvous = loopback(free_port());
    let local_port = free_port();
    socks_pair(rendezvous, local_port);

    let mut conn = connect_retry(loopback(local_port));

    let mut request = vec![4, 1];
    request.extend_from_slice(&dst_port.to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.extend_from_slice(b"tester\0");
    conn.write_all(&request).unwrap();

    let mut reply = [0u8; 8];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(reply[0], 0);
    assert_eq!(reply[1], 0x5A, "request granted");

    conn.write_all(b"hi").unwrap();
    let mut answer = [0u8; 2];
    conn.read_exact(&mut answer).unwrap();
    assert_eq!(&answer, b"yo");

    dest.join().unwrap();
}

#[test]
fn socks_protocol_violation_closes_the_session() {
    let rendezvous = loopback(free_port());
    let local_port = free_port();
    socks_pair(rendezvous, local_port);

    let mut conn = connect_retry(loopback(local_port));
    // not a SOCKS version byte at all
    conn.write_all(b"GET / HTTP/1.1\r\n").unwrap();

    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).expect("session should close cleanly");
    assert!(buf.is_empty(), "no reply for a rejected handshake");
}
