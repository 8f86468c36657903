//! TCP echo server demo
//!
//! One fiber accepts; each connection gets its own fiber. All socket
//! calls look blocking but park the fiber on the reactor, so a handful of
//! worker threads serve any number of connections.
//!
//! Try it:
//!
//! ```text
//! cargo run -p weft-echo
//! ncat 127.0.0.1 8080
//! ```
//!
//! Environment variables:
//! - `WEFT_WORKERS=<n>` - worker threads (default: 4)
//! - `WEFT_PORT=<port>` - listen port (default: 8080)
//! - `RUST_LOG=debug` - runtime logging

use weft::net::TcpListener;
use weft::{Reactor, ScheduleTask};

fn env_get(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() {
    env_logger::init();

    let workers = env_get("WEFT_WORKERS", 4);
    let port = env_get("WEFT_PORT", 8080) as u16;

    println!("=== weft echo ===");
    println!("listening on 127.0.0.1:{} with {} workers", port, workers);

    let reactor = Reactor::new(workers, false, "echo");

    reactor.schedule(ScheduleTask::call(move || {
        let listener = match TcpListener::bind(port) {
            Ok(l) => l,
            Err(e) => {
                log::error!("bind({}) failed: {}", port, e);
                return;
            }
        };

        loop {
            let stream = match listener.accept() {
                Ok(s) => s,
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    break;
                }
            };
            log::info!("connection on fd {}", stream.fd());

            let reactor = Reactor::current().unwrap();
            reactor.schedule(ScheduleTask::call(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Err(e) = stream.write_all(&buf[..n]) {
                                log::warn!("write failed: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("read failed: {}", e);
                            break;
                        }
                    }
                }
                log::info!("connection on fd {} closed", stream.fd());
            }));
        }
    }));

    // The accept loop runs forever; park the main thread.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
