use mqlink::{ConnId, Error, Link};

use std::io::Write;
use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// Set TEST_LOG=1 (and e.g. RUST_LOG=mqlink=trace) to see link internals.
fn init_logging() {
    INIT.call_once(|| {
        if std::env::var("TEST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .init();
        }
    });
}

fn test_config() -> config::Config {
    config::Config::builder()
        .build()
        .expect("Failed to build test config")
}

const POLL: Duration = Duration::from_millis(5);
const CHUNK: Duration = Duration::from_millis(25);

/// Drives two links on the current thread in short alternating bursts until
/// `done` reports true or the timeout elapses.
fn pump_until(a: &mut Link, b: &mut Link, timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        a.run_loop(POLL, None, Some(CHUNK)).expect("event loop failed");
        b.run_loop(POLL, None, Some(CHUNK)).expect("event loop failed");
        if done() {
            return true;
        }
    }
    false
}

#[derive(Default)]
struct Tally {
    connects: Vec<ConnId>,
    disconnects: Vec<ConnId>,
    recvs: Vec<(ConnId, Vec<u8>)>,
    readies: Vec<(ConnId, usize)>,
}

fn watch(link: &mut Link) -> Arc<Mutex<Tally>> {
    let tally = Arc::new(Mutex::new(Tally::default()));
    let t = tally.clone();
    link.on_connect(move |conn_id| t.lock().unwrap().connects.push(conn_id));
    let t = tally.clone();
    link.on_disconnect(move |conn_id| t.lock().unwrap().disconnects.push(conn_id));
    let t = tally.clone();
    link.on_recv(move |conn_id, data| t.lock().unwrap().recvs.push((conn_id, data)));
    let t = tally.clone();
    link.on_ready_to_send(move |conn_id, size| t.lock().unwrap().readies.push((conn_id, size)));
    tally
}

#[test]
fn connect_and_exchange() {
    init_logging();
    let config = test_config();

    let mut server = Link::new(&config).expect("Failed to create server link");
    let server_tally = watch(&mut server);
    let server_iface = server.interface();
    let t = server_tally.clone();
    server.on_recv(move |conn_id, data| {
        t.lock().unwrap().recvs.push((conn_id, data.clone()));
        // echo back through the interface; applied on the next loop pass
        server_iface.send(conn_id, data);
    });
    let addr = server
        .add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");

    let mut client = Link::new(&config).expect("Failed to create client link");
    let client_tally = watch(&mut client);
    let client_iface = client.interface();
    let t = client_tally.clone();
    client.on_connect(move |conn_id| {
        t.lock().unwrap().connects.push(conn_id);
        client_iface.send(conn_id, b"hello".to_vec());
    });
    client
        .add_connector(addr, Some(Duration::from_millis(100)), None)
        .expect("Failed to add connector");

    let echoed = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        !client_tally.lock().unwrap().recvs.is_empty()
    });
    assert!(echoed, "client never received the echo");

    {
        let server_tally = server_tally.lock().unwrap();
        let client_tally = client_tally.lock().unwrap();
        assert_eq!(server_tally.connects.len(), 1);
        assert_eq!(client_tally.connects.len(), 1);
        assert_eq!(server_tally.recvs[0].1, b"hello");
        assert_eq!(client_tally.recvs[0].1, b"hello");
        // each side completed exactly one send of the full payload
        assert_eq!(client_tally.readies, vec![(client_tally.connects[0], 5)]);
        assert_eq!(server_tally.readies, vec![(server_tally.connects[0], 5)]);
    }

    client.cleanup();
    assert_eq!(client_tally.lock().unwrap().disconnects.len(), 1);

    // the server notices the closure on its next loop pass
    server
        .run_loop(POLL, None, Some(Duration::from_millis(200)))
        .expect("event loop failed");
    assert_eq!(server_tally.lock().unwrap().disconnects.len(), 1);
    server.cleanup();
}

#[test]
fn large_send_completes_with_single_callback() {
    init_logging();
    let config = test_config();
    let payload_len = 4 * 1024 * 1024;

    let mut server = Link::new(&config).expect("Failed to create server link");
    let server_tally = watch(&mut server);
    let addr = server
        .add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");

    let mut client = Link::new(&config).expect("Failed to create client link");
    let client_tally = watch(&mut client);
    client
        .add_connector(addr, Some(Duration::from_secs(10)), None)
        .expect("Failed to add connector");

    let connected = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        !client_tally.lock().unwrap().connects.is_empty()
    });
    assert!(connected, "connection was never established");
    let conn_id = client_tally.lock().unwrap().connects[0];

    client
        .send(conn_id, vec![0xAB; payload_len])
        .expect("send failed");
    // the first send is still in flight
    let second = client.send(conn_id, b"more".to_vec());
    assert!(matches!(second, Err(Error::SendNotFinished { .. })));

    let delivered = pump_until(&mut server, &mut client, Duration::from_secs(10), || {
        let received: usize = server_tally
            .lock()
            .unwrap()
            .recvs
            .iter()
            .map(|(_, data)| data.len())
            .sum();
        received == payload_len
    });
    assert!(delivered, "server never received the full payload");

    // one completion callback carrying the total size, not one per write
    let readies = client_tally.lock().unwrap().readies.clone();
    assert_eq!(readies, vec![(conn_id, payload_len)]);

    // with the send finished, sending again works
    client.send(conn_id, b"again".to_vec()).expect("send failed");
    let arrived = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        server_tally
            .lock()
            .unwrap()
            .recvs
            .iter()
            .map(|(_, data)| data.len())
            .sum::<usize>()
            == payload_len + 5
    });
    assert!(arrived, "follow-up send never arrived");

    client.cleanup();
    server.cleanup();
}

#[test]
fn quiet_burst_is_fully_delivered() {
    init_logging();
    let payload_len = 1024 * 1024;

    let mut server = Link::new(&test_config()).expect("Failed to create server link");
    let server_tally = watch(&mut server);
    let addr = server
        .add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");

    // one big write, then silence: nothing on the wire ever announces the
    // tail again, so the link itself must drain it
    let writer = std::thread::spawn(move || {
        let mut stream = StdTcpStream::connect(addr).expect("Failed to connect");
        stream
            .write_all(&vec![0x5A; payload_len])
            .expect("Failed to write payload");
        std::thread::sleep(Duration::from_millis(100));
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = 0;
    while Instant::now() < deadline {
        server
            .run_loop(POLL, None, Some(CHUNK))
            .expect("event loop failed");
        received = server_tally
            .lock()
            .unwrap()
            .recvs
            .iter()
            .map(|(_, data)| data.len())
            .sum();
        if received == payload_len {
            break;
        }
    }
    assert_eq!(
        received, payload_len,
        "receiver stalled with part of the burst undelivered"
    );

    writer.join().expect("writer thread panicked");
    server.cleanup();
}

#[test]
fn reconnect_attempts_respect_backoff_spacing() {
    init_logging();
    let interval = Duration::from_millis(250);
    let config = test_config();

    let mut server = Link::new(&config).expect("Failed to create server link");
    let server_iface = server.interface();
    // drop every peer right away so each client attempt is observable
    server.on_connect(move |conn_id| server_iface.close(conn_id));
    let addr = server
        .add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");

    let mut client = Link::new(&config).expect("Failed to create client link");
    let connect_times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let t = connect_times.clone();
    client.on_connect(move |_| t.lock().unwrap().push(Instant::now()));
    client
        .add_connector(addr, Some(interval), None)
        .expect("Failed to add connector");

    let observed = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        connect_times.lock().unwrap().len() >= 3
    });
    assert!(observed, "never saw three connect attempts");

    let times = connect_times.lock().unwrap().clone();
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= interval,
            "attempts only {gap:?} apart, configured interval is {interval:?}"
        );
    }

    client.cleanup();
    server.cleanup();
}

#[test]
fn connector_retries_until_listener_appears() {
    init_logging();
    // learn a free port, then leave it closed for the first attempts
    let addr = {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        listener.local_addr().expect("Failed to get local address")
    };

    let config = config::Config::builder()
        .set_default("client.reconnect_interval", 0.1)
        .expect("Failed to set default")
        .build()
        .expect("Failed to build test config");

    let mut client = Link::new_named(&config, "client").expect("Failed to create client link");
    let client_tally = watch(&mut client);
    client
        .add_connector(addr, None, None)
        .expect("Failed to add connector");

    // a couple of refused attempts
    client
        .run_loop(POLL, None, Some(Duration::from_millis(300)))
        .expect("event loop failed");
    assert!(client_tally.lock().unwrap().connects.is_empty());

    let mut server = Link::new(&test_config()).expect("Failed to create server link");
    let server_tally = watch(&mut server);
    server.add_listener(addr, None).expect("Failed to add listener");

    let connected = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        !client_tally.lock().unwrap().connects.is_empty()
            && !server_tally.lock().unwrap().connects.is_empty()
    });
    assert!(connected, "connector never reached the late listener");
    assert_eq!(client_tally.lock().unwrap().connects.len(), 1);
    assert_eq!(server_tally.lock().unwrap().connects.len(), 1);

    client.cleanup();
    server.cleanup();
}

#[test]
fn disconnect_fires_once_and_close_is_idempotent() {
    init_logging();
    let config = test_config();

    let mut server = Link::new(&config).expect("Failed to create server link");
    let server_tally = watch(&mut server);
    let addr = server
        .add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");

    let mut client = Link::new(&config).expect("Failed to create client link");
    let client_tally = watch(&mut client);
    // long interval so no reconnection lands within the test window
    client
        .add_connector(addr, Some(Duration::from_secs(60)), None)
        .expect("Failed to add connector");

    let connected = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        !server_tally.lock().unwrap().connects.is_empty()
            && !client_tally.lock().unwrap().connects.is_empty()
    });
    assert!(connected, "connection was never established");

    let server_conn = server_tally.lock().unwrap().connects[0];
    let client_conn = client_tally.lock().unwrap().connects[0];

    server.close(server_conn);
    assert_eq!(server_tally.lock().unwrap().disconnects, vec![server_conn]);
    // closing an already-closed connection is a no-op
    server.close(server_conn);
    assert_eq!(server_tally.lock().unwrap().disconnects.len(), 1);

    let noticed = pump_until(&mut server, &mut client, Duration::from_secs(5), || {
        !client_tally.lock().unwrap().disconnects.is_empty()
    });
    assert!(noticed, "client never noticed the closure");
    assert_eq!(client_tally.lock().unwrap().disconnects, vec![client_conn]);

    // sends to a gone connection are dropped, not errors
    client
        .send(client_conn, b"too late".to_vec())
        .expect("send to stale conn id should be dropped silently");

    client.cleanup();
    server.cleanup();
}

#[test]
fn registration_errors() {
    init_logging();
    let mut link = Link::new(&test_config()).expect("Failed to create link");

    let addr = link
        .add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");
    assert!(matches!(
        link.add_listener(addr, None),
        Err(Error::ListenerAlreadyRegistered { .. })
    ));
    assert_eq!(link.listener_addresses(), vec![addr]);

    let target: std::net::SocketAddr = "127.0.0.1:1".parse().expect("Failed to parse address");
    link.add_connector(target, None, None)
        .expect("Failed to add connector");
    assert!(matches!(
        link.add_connector(target, None, None),
        Err(Error::ConnectorAlreadyRegistered { .. })
    ));

    link.remove_connector(target).expect("Failed to remove connector");
    assert!(matches!(
        link.remove_connector(target),
        Err(Error::ConnectorNotFound { .. })
    ));

    link.remove_listener(addr).expect("Failed to remove listener");
    assert!(matches!(
        link.remove_listener(addr),
        Err(Error::ListenerNotFound { .. })
    ));

    link.cleanup();
}

#[test]
fn cleanup_leaves_no_state() {
    init_logging();
    let mut link = Link::new(&test_config()).expect("Failed to create link");
    link.add_listener("127.0.0.1:0", None)
        .expect("Failed to add listener");
    link.add_connector("127.0.0.1:1", Some(Duration::from_millis(50)), None)
        .expect("Failed to add connector");
    link.run_loop(POLL, None, Some(Duration::from_millis(100)))
        .expect("event loop failed");

    // cleanup asserts internally that nothing survives
    link.cleanup();
    assert!(link.listener_addresses().is_empty());
}

#[test]
fn stop_from_another_thread() {
    init_logging();
    let mut link = Link::new(&test_config()).expect("Failed to create link");
    let iface = link.interface();

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        iface.stop();
    });

    let started = Instant::now();
    // a very long poll timeout; only the waker can end this promptly
    link.run_loop(Duration::from_secs(10), None, None)
        .expect("event loop failed");
    assert!(started.elapsed() < Duration::from_secs(5));

    stopper.join().expect("stopper thread panicked");
    link.cleanup();
}
