use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use wirepool::{EventCallback, Reactor};

fn reactor(nb_workers: usize) -> Reactor {
    let _ = env_logger::builder().is_test(true).try_init();
    Reactor::new(nb_workers).unwrap()
}

#[test]
fn track_wakes_a_blocked_poll_promptly() {
    let reactor = reactor(1);
    let (local, mut peer) = UnixStream::pair().unwrap();
    let fd = local.as_raw_fd();

    // data is already pending; the poll thread is blocked in an infinite
    // wait and only the self-pipe notify can make it see the new socket
    peer.write_all(b"x").unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let (tx, rx) = crossbeam_channel::bounded(1);
    let drain = parking_lot::Mutex::new(local.try_clone().unwrap());
    let callback: EventCallback = Arc::new(move |_| {
        use std::io::Read;
        let mut buf = [0u8; 8];
        let _ = drain.lock().read(&mut buf);
        tx.send(Instant::now()).unwrap();
    });

    let tracked_at = Instant::now();
    reactor.track(fd, Some(callback), None);

    let dispatched_at = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(
        dispatched_at - tracked_at < Duration::from_millis(100),
        "reactor took {:?} to react to track()",
        dispatched_at - tracked_at
    );

    reactor.untrack(fd);
    reactor.wait_for_removal(fd);
}

#[test]
fn retracking_a_socket_resumes_dispatch() {
    let reactor = reactor(1);
    let (local, mut peer) = UnixStream::pair().unwrap();
    let fd = local.as_raw_fd();

    let make_callback = |label: &'static str, tx: crossbeam_channel::Sender<&'static str>| {
        let drain = parking_lot::Mutex::new(local.try_clone().unwrap());
        let callback: EventCallback = Arc::new(move |_| {
            use std::io::Read;
            let mut buf = [0u8; 8];
            let _ = drain.lock().read(&mut buf);
            tx.send(label).unwrap();
        });
        callback
    };

    let (tx, rx) = crossbeam_channel::unbounded();

    reactor.track(fd, Some(make_callback("first", tx.clone())), None);
    peer.write_all(b"1").unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "first");

    reactor.untrack(fd);
    reactor.wait_for_removal(fd);

    reactor.track(fd, Some(make_callback("second", tx)), None);
    peer.write_all(b"2").unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "second");

    reactor.untrack(fd);
    reactor.wait_for_removal(fd);
}

#[test]
fn read_and_write_interest_are_independent() {
    let reactor = reactor(2);
    let (local, peer) = UnixStream::pair().unwrap();
    let fd = local.as_raw_fd();

    // no data pending: only the write side may fire
    let (rd_tx, rd_rx) = crossbeam_channel::unbounded();
    let (wr_tx, wr_rx) = crossbeam_channel::bounded(1);

    let rd: EventCallback = Arc::new(move |_| rd_tx.send(()).unwrap());
    let wr: EventCallback = {
        let reactor_fd = fd;
        let wr_tx = wr_tx.clone();
        Arc::new(move |fd| {
            assert_eq!(fd, reactor_fd);
            let _ = wr_tx.try_send(());
        })
    };

    reactor.track(fd, Some(rd), Some(wr));

    assert!(wr_rx.recv_timeout(Duration::from_secs(1)).is_ok());
    assert!(rd_rx.recv_timeout(Duration::from_millis(100)).is_err());

    reactor.untrack(fd);
    reactor.wait_for_removal(fd);
    drop(peer);
}
