//! End-to-end exercises against the public `Manager` API: real sockets,
//! real signals, real fd passing. Each test builds its own `Manager`
//! rather than going through the process-wide `manager::global()`, since
//! several of these run concurrently in the same test binary.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::FromRawFd;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use conmgr::callbacks::Arg;
use conmgr::connection::{WorkItem, WorkStatus};
use conmgr::{Callbacks, Config, ConnType, Manager};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal `on_data` satisfying RAW's capability check without doing
/// anything — enough for tests that only care about listener/signal/fd
/// bookkeeping, not actual echoed bytes.
fn noop_callbacks() -> Callbacks {
    let mut callbacks = Callbacks::default();
    callbacks.on_data = Some(Box::new(|_id, data: &[u8], _arg: &mut Arg| data.len()));
    callbacks
}

#[test]
fn echo_round_trip() {
    let port = free_port();
    let manager_slot: Arc<OnceLock<Arc<Manager>>> = Arc::new(OnceLock::new());
    let slot = manager_slot.clone();

    let mut callbacks = Callbacks::default();
    callbacks.on_data = Some(Box::new(move |id, data: &[u8], _arg: &mut Arg| {
        if let Some(manager) = slot.get() {
            let _ = manager.write(id, data.to_vec());
        }
        data.len()
    }));

    let manager = Manager::init(Config::default(), callbacks).expect("manager init");
    manager_slot.set(manager.clone()).ok();

    manager
        .create_listen_sockets(ConnType::Raw, &format!("127.0.0.1:{}", port), None)
        .expect("listen");

    thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read echo");
    assert_eq!(&buf[..n], b"hello\n");

    manager.shutdown();
}

#[test]
fn unix_echo_round_trip() {
    let path = format!("/tmp/conmgr-test-{}.sock", std::process::id());
    let _ = std::fs::remove_file(&path);

    let manager_slot: Arc<OnceLock<Arc<Manager>>> = Arc::new(OnceLock::new());
    let slot = manager_slot.clone();

    let mut callbacks = Callbacks::default();
    callbacks.on_data = Some(Box::new(move |id, data: &[u8], _arg: &mut Arg| {
        if let Some(manager) = slot.get() {
            let _ = manager.write(id, data.to_vec());
        }
        data.len()
    }));

    let manager = Manager::init(Config::default(), callbacks).expect("manager init");
    manager_slot.set(manager.clone()).ok();

    manager
        .create_listen_sockets(ConnType::Raw, &format!("unix:{}", path), None)
        .expect("listen");

    thread::sleep(Duration::from_millis(100));

    let mut stream = std::os::unix::net::UnixStream::connect(&path).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"hello\n").unwrap();

    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read echo");
    assert_eq!(&buf[..n], b"hello\n");

    drop(stream);
    manager.shutdown();

    assert!(!std::path::Path::new(&path).exists(), "listener must unlink its path on close");
}

#[test]
fn duplicate_listener_is_rejected() {
    let port = free_port();
    let manager = Manager::init(Config::default(), noop_callbacks()).expect("manager init");

    manager
        .create_listen_sockets(ConnType::Raw, &format!("127.0.0.1:{}", port), None)
        .expect("first listen succeeds");

    let second = manager.create_listen_sockets(ConnType::Raw, &format!("127.0.0.1:{}", port), None);
    assert!(second.is_err(), "second listener on the same address must be rejected");

    manager.shutdown();
}

#[test]
fn signal_delivery_runs_registered_work() {
    let manager = Manager::init(Config::default(), noop_callbacks()).expect("manager init");

    let (tx, rx) = mpsc::channel();
    manager
        .register_signal(libc::SIGUSR1, move || {
            let tx = tx.clone();
            WorkItem::run(move |status| {
                let _ = tx.send(status);
            })
        })
        .expect("register signal");

    unsafe {
        libc::raise(libc::SIGUSR1);
    }

    let status = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("registered work ran after the signal was raised");
    assert_eq!(status, WorkStatus::Run);

    manager.shutdown();
}

#[test]
fn connect_to_unreachable_address_surfaces_as_error() {
    // Bind to grab a free port, then drop the listener immediately so
    // nothing is accepting connections on it.
    let port = free_port();

    let (tx, rx) = mpsc::channel();
    let mut callbacks = Callbacks::default();
    callbacks.on_data = Some(Box::new(|_id, data: &[u8], _arg: &mut Arg| data.len()));
    callbacks.on_finish = Some(Box::new(move |id, _arg, _status| {
        let _ = tx.send(id);
    }));

    let manager = Manager::init(Config::default(), callbacks).expect("manager init");

    match manager.create_connect_socket(ConnType::Raw, &format!("127.0.0.1:{}", port), None) {
        // Connect refused synchronously: the manager surfaced it without
        // ever registering a connection.
        Err(_) => {}
        // Connect pending: the watch loop learns of the refusal on the
        // first write-readiness event and finalizes the connection,
        // running on_finish.
        Ok(id) => {
            let finished = rx
                .recv_timeout(Duration::from_secs(3))
                .expect("connect failure eventually finalizes the connection");
            assert_eq!(finished, id);
        }
    }

    manager.shutdown();
}

#[test]
fn close_drains_pending_writes_before_eof() {
    let port = free_port();
    let manager_slot: Arc<OnceLock<Arc<Manager>>> = Arc::new(OnceLock::new());
    let slot = manager_slot.clone();

    let mut callbacks = Callbacks::default();
    callbacks.on_data = Some(Box::new(|_id, data: &[u8], _arg: &mut Arg| data.len()));
    callbacks.on_connection = Some(Box::new(move |id| {
        if let Some(manager) = slot.get() {
            let payload = vec![0xABu8; 1024 * 1024];
            let _ = manager.write(id, payload);
            manager.queue_close_fd(id);
        }
        None
    }));

    let manager = Manager::init(Config::default(), callbacks).expect("manager init");
    manager_slot.set(manager.clone()).ok();

    manager
        .create_listen_sockets(ConnType::Raw, &format!("127.0.0.1:{}", port), None)
        .expect("listen");

    thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut total = Vec::with_capacity(1024 * 1024);
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        total.extend_from_slice(&buf[..n]);
    }

    assert_eq!(total.len(), 1024 * 1024, "peer must see every queued byte before EOF");
    assert!(total.iter().all(|&b| b == 0xAB));

    manager.shutdown();
}

#[test]
fn fd_passing_delivers_a_working_connection() {
    let (tx, rx) = mpsc::channel();
    let mut callbacks = Callbacks::default();
    callbacks.on_data = Some(Box::new(move |id, data: &[u8], _arg: &mut Arg| {
        let _ = tx.send((id, data.to_vec()));
        data.len()
    }));

    let manager = Manager::init(Config::default(), callbacks).expect("manager init");

    // The control channel the fd travels over.
    let mut ctrl = [0 as libc::c_int; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, ctrl.as_mut_ptr()) },
        0
    );

    // The object being passed across: `passed[0]` is handed to
    // `queue_send_fd` (and closed by it); `passed[1]` stays with the test
    // so writes to it land on the connection built from the received end.
    let mut passed = [0 as libc::c_int; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, passed.as_mut_ptr()) },
        0
    );

    let sender = manager
        .process_fd(ConnType::Raw, ctrl[0], ctrl[0], None)
        .expect("adopt sender side of control channel");
    let receiver = manager
        .process_fd(ConnType::Raw, ctrl[1], ctrl[1], None)
        .expect("adopt receiver side of control channel");

    manager
        .queue_receive_fd(receiver, ConnType::Raw, Some(Box::new(())))
        .expect("queue receive_fd");
    manager
        .queue_send_fd(sender, passed[0])
        .expect("queue send_fd");

    // Give the workers time to ferry the fd across the control channel
    // and register it as a new connection.
    thread::sleep(Duration::from_millis(200));

    let mut retained_end = unsafe { std::fs::File::from_raw_fd(passed[1]) };
    retained_end.write_all(b"ping").expect("write to the passed fd's peer");

    let (id, data) = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("on_data fired for the connection built from the passed fd");
    assert_eq!(data, b"ping");
    assert_ne!(id, sender);
    assert_ne!(id, receiver);

    manager.shutdown();
}
