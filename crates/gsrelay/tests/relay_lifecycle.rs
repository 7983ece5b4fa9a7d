use std::{
    io::Read,
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

#[test]
fn no_server_listening_exits_255() {
    // single-session client pointed at a rendezvous nobody bound
    let cfg = Config::client(loopback(free_port()));

    let handle = thread::spawn(move || {
        let transport = TcpGs::new(cfg.rendezvous);
        match Relay::new(cfg, transport) {
            Ok(mut relay) => relay.run(),
            Err(_) => 255,
        }
    });
    assert_eq!(handle.join().unwrap(), 255);
}

#[test]
fn second_peer_is_rejected_when_server_takes_one() {
    let rendezvous = loopback(free_port());

    // default sink is stdio, which serves exactly one peer
    let server = Config::server(rendezvous);
    let transport = TcpGs::new(server.rendezvous);
    let mut relay = Relay::new(server, transport).expect("server setup failed");
    let _server = thread::spawn(move || relay.run());

    let local_port = free_port();
    let mut client = Config::client(rendezvous);
    client.port = local_port;
    client.multi_peer = true;
    let transport = TcpGs::new(client.rendezvous);
    let mut relay = Relay::new(client, transport).expect("client setup failed");
    let _client = thread::spawn(move || relay.run());

    let _first = connect_retry(loopback(local_port));
    // give the first session time to claim the single accept slot
    thread::sleep(Duration::from_millis(300));

    let mut second = connect_retry(loopback(local_port));
    let mut buf = Vec::new();
    second.read_to_end(&mut buf).expect("second session should die cleanly");
    assert!(buf.is_empty(), "second peer must be turned away without data");

    // the client process survives: it still accepts local connections
    let _third = connect_retry(loopback(local_port));
}
