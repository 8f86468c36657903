//! Accept-then-echo across two fibers, every byte moved through the
//! hooked syscalls.

use weft_runtime::net::{TcpListener, TcpStream};
use weft_runtime::{syscall, Reactor, ScheduleTask};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn wait_for(counter: &AtomicUsize, expect: usize, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < expect {
        assert!(Instant::now() < deadline, "{} did not finish", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn accept_then_echo_roundtrip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let reactor = Reactor::new(4, false, "echo");
    let port = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let echoed = Arc::new(Mutex::new(Vec::new()));

    // Fiber A: serve one connection, read 5 bytes, write them back.
    {
        let port = port.clone();
        let done = done.clone();
        reactor.schedule(ScheduleTask::call(move || {
            let listener = TcpListener::bind(0).unwrap();
            port.store(listener.local_port().unwrap() as usize, Ordering::SeqCst);

            let stream = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < buf.len() {
                let n = stream.read(&mut buf[got..]).unwrap();
                assert!(n > 0, "peer closed early");
                got += n;
            }
            stream.write_all(&buf).unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Fiber B: connect, send "HELLO", read the echo.
    {
        let port = port.clone();
        let done = done.clone();
        let echoed = echoed.clone();
        reactor.schedule(ScheduleTask::call(move || {
            let port = loop {
                let p = port.load(Ordering::SeqCst);
                if p != 0 {
                    break p as u16;
                }
                syscall::usleep(1_000);
            };

            let stream = TcpStream::connect(port).unwrap();
            stream.write_all(b"HELLO").unwrap();

            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < buf.len() {
                let n = stream.read(&mut buf[got..]).unwrap();
                assert!(n > 0, "peer closed early");
                got += n;
            }
            echoed.lock().unwrap().extend_from_slice(&buf);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    wait_for(&done, 2, "echo fibers");
    assert_eq!(echoed.lock().unwrap().as_slice(), b"HELLO");

    // Every registration was consumed; nothing left pending.
    assert_eq!(reactor.pending_event_count(), 0);
    reactor.stop();
}

#[test]
fn many_connections_echo() {
    let _ = env_logger::builder().is_test(true).try_init();

    const CLIENTS: usize = 8;
    let reactor = Reactor::new(4, false, "echo_many");
    let port = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    {
        let port = port.clone();
        reactor.schedule(ScheduleTask::call(move || {
            let listener = TcpListener::bind(0).unwrap();
            port.store(listener.local_port().unwrap() as usize, Ordering::SeqCst);

            for _ in 0..CLIENTS {
                let stream = listener.accept().unwrap();
                let reactor = Reactor::current().unwrap();
                reactor.schedule(ScheduleTask::call(move || {
                    let mut buf = [0u8; 32];
                    loop {
                        let n = stream.read(&mut buf).unwrap();
                        if n == 0 {
                            break;
                        }
                        stream.write_all(&buf[..n]).unwrap();
                    }
                }));
            }
        }));
    }

    for i in 0..CLIENTS {
        let port = port.clone();
        let done = done.clone();
        reactor.schedule(ScheduleTask::call(move || {
            let port = loop {
                let p = port.load(Ordering::SeqCst);
                if p != 0 {
                    break p as u16;
                }
                syscall::usleep(1_000);
            };

            let msg = format!("client-{}", i);
            let stream = TcpStream::connect(port).unwrap();
            stream.write_all(msg.as_bytes()).unwrap();

            let mut buf = vec![0u8; msg.len()];
            let mut got = 0;
            while got < buf.len() {
                let n = stream.read(&mut buf[got..]).unwrap();
                assert!(n > 0);
                got += n;
            }
            assert_eq!(buf, msg.as_bytes());
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    wait_for(&done, CLIENTS, "echo clients");
    reactor.stop();
}
