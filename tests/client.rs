use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use wirepool::{ReadRequest, Reactor, TcpClient, TcpServer, WriteRequest};

fn reactor(nb_workers: usize) -> Arc<Reactor> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(Reactor::new(nb_workers).unwrap())
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo every read back to the peer, then re-arm.
fn arm_echo(client: &TcpClient) {
    let chained = client.clone();
    let _ = client.async_read(ReadRequest {
        size_to_read: 1024,
        on_complete: Some(Box::new(move |result| {
            if !result.success {
                return;
            }
            let _ = chained.async_write(WriteRequest {
                buffer: result.buffer,
                on_complete: None,
            });
            arm_echo(&chained);
        })),
    });
}

fn start_echo_server(reactor: Arc<Reactor>) -> (TcpServer, u16) {
    let port = free_port();
    let server = TcpServer::with_reactor(reactor);
    server
        .start("127.0.0.1", port, |client| {
            arm_echo(client);
            false
        })
        .unwrap();
    (server, port)
}

#[test]
fn echo_round_trip() {
    let reactor = reactor(2);
    let (_server, port) = start_echo_server(reactor.clone());

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();

    let (write_tx, write_rx) = crossbeam_channel::bounded(1);
    client
        .async_write(WriteRequest {
            buffer: b"abc".to_vec(),
            on_complete: Some(Box::new(move |result| {
                write_tx.send((result.success, result.bytes_written)).unwrap();
            })),
        })
        .unwrap();

    let (read_tx, read_rx) = crossbeam_channel::bounded(1);
    client
        .async_read(ReadRequest {
            size_to_read: 3,
            on_complete: Some(Box::new(move |result| {
                read_tx.send((result.success, result.buffer)).unwrap();
            })),
        })
        .unwrap();

    let (success, bytes_written) = write_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(success);
    assert_eq!(bytes_written, 3);

    let (success, buffer) = read_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(success);
    assert_eq!(buffer, b"abc");

    client.disconnect(true);
}

#[test]
fn reads_complete_in_submission_order() {
    let reactor = reactor(1);
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();

    let (accepted, _) = listener.accept().unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    for _ in 0..2 {
        let tx = tx.clone();
        client
            .async_read(ReadRequest {
                size_to_read: 3,
                on_complete: Some(Box::new(move |result| {
                    tx.send(result.buffer).unwrap();
                })),
            })
            .unwrap();
    }

    // one six-byte burst must be split across the two queued reads
    use std::io::Write;
    (&accepted).write_all(b"abcdef").unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"abc");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"def");

    client.disconnect(true);
}

#[test]
fn connect_failure_is_fast_and_leaves_client_disconnected() {
    let client = TcpClient::with_reactor(reactor(1));

    let started = Instant::now();
    let result = client.connect("127.0.0.1", 1, Some(Duration::from_millis(200)));
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(!client.is_connected());
}

#[test]
fn invalid_host_fails_synchronously() {
    let client = TcpClient::with_reactor(reactor(1));
    assert!(client.connect("invalid url", 1234, None).is_err());
    assert!(!client.is_connected());
}

#[test]
fn double_connect_is_rejected() {
    let reactor = reactor(1);
    let (_server, port) = start_echo_server(reactor.clone());

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();
    assert!(client.is_connected());

    assert!(client.connect("127.0.0.1", port, None).is_err());
    assert!(client.is_connected());

    client.disconnect(true);
}

#[test]
fn disconnect_then_reconnect_succeeds() {
    let reactor = reactor(1);
    let (_server, port) = start_echo_server(reactor.clone());

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();
    client.disconnect(true);
    assert!(!client.is_connected());

    client.connect("127.0.0.1", port, None).unwrap();
    assert!(client.is_connected());
    client.disconnect(true);
}

#[test]
fn disconnect_of_disconnected_client_is_noop() {
    let client = TcpClient::with_reactor(reactor(1));
    assert!(!client.is_connected());
    client.disconnect(true);
    assert!(!client.is_connected());
}

#[test]
fn host_and_port_are_reported() {
    let reactor = reactor(1);
    let (_server, port) = start_echo_server(reactor.clone());

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();
    assert_eq!(client.host(), "127.0.0.1");
    assert_eq!(client.port(), port);
    client.disconnect(true);
}

#[test]
fn async_read_on_disconnected_client_is_rejected() {
    let client = TcpClient::with_reactor(reactor(1));
    let result = client.async_read(ReadRequest {
        size_to_read: 16,
        on_complete: None,
    });
    assert!(result.is_err());
}

#[test]
fn disconnect_during_pending_read_does_not_hang() {
    let reactor = reactor(1);
    let port = free_port();
    // a listener that accepts but never sends
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();
    let (_accepted, _) = listener.accept().unwrap();

    let (cb_tx, cb_rx) = crossbeam_channel::unbounded();
    client
        .async_read(ReadRequest {
            size_to_read: 1024,
            on_complete: Some(Box::new(move |result| {
                cb_tx.send(result.success).unwrap();
            })),
        })
        .unwrap();

    let (handler_tx, handler_rx) = crossbeam_channel::unbounded();
    client.set_on_disconnection_handler(move || {
        handler_tx.send(()).unwrap();
    });

    client.disconnect(true);
    assert!(!client.is_connected());

    // the queued request was dropped, or raced dispatch and failed; it
    // must never report success
    if let Ok(success) = cb_rx.recv_timeout(Duration::from_millis(200)) {
        assert!(!success);
    }
    // voluntary disconnect fires no handler, a raced failure at most one
    let fired = handler_rx.try_iter().count();
    assert!(fired <= 1, "disconnection handler fired {} times", fired);
}

#[test]
fn peer_close_fails_read_and_fires_handler_once() {
    let reactor = reactor(2);
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    let client = TcpClient::with_reactor(reactor);
    client.connect("127.0.0.1", port, None).unwrap();

    let (handler_tx, handler_rx) = crossbeam_channel::unbounded();
    client.set_on_disconnection_handler(move || {
        handler_tx.send(()).unwrap();
    });

    let (cb_tx, cb_rx) = crossbeam_channel::bounded(1);
    client
        .async_read(ReadRequest {
            size_to_read: 64,
            on_complete: Some(Box::new(move |result| {
                cb_tx.send(result.success).unwrap();
            })),
        })
        .unwrap();

    // accept and close straight away: the pending read must observe EOF
    let (accepted, _) = listener.accept().unwrap();
    drop(accepted);

    assert_eq!(cb_rx.recv_timeout(Duration::from_secs(2)).unwrap(), false);
    handler_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(!client.is_connected());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(handler_rx.try_iter().count(), 0, "handler fired more than once");
}

#[test]
fn default_reactor_client_works_end_to_end() {
    let port = free_port();
    let server = TcpServer::new().unwrap();
    server
        .start("127.0.0.1", port, |client| {
            arm_echo(client);
            false
        })
        .unwrap();

    let client = TcpClient::new().unwrap();
    client.connect("127.0.0.1", port, None).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    client
        .async_write(WriteRequest {
            buffer: b"ping".to_vec(),
            on_complete: None,
        })
        .unwrap();
    client
        .async_read(ReadRequest {
            size_to_read: 4,
            on_complete: Some(Box::new(move |result| {
                tx.send(result.buffer).unwrap();
            })),
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"ping");

    client.disconnect(true);
    server.stop(true, true);
}
