//! Shared harness for the end-to-end tests: a real engine on a loopback
//! socket, wire-record builders, and poll-until helpers.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use pinba_engine::proto::WireRequest;
use pinba_engine::{Engine, EngineOptions};
use prost::Message;

/// Starts an engine on 127.0.0.1 with an ephemeral port and short
/// batch timeouts, so tests observe results quickly.
pub fn start_engine() -> Engine {
    let mut options = EngineOptions::default();
    options.collector.address = "127.0.0.1:0".parse().unwrap();
    options.collector.n_threads = 2;
    options.collector.batch_timeout = Duration::from_millis(10);
    options.repacker.n_threads = 2;
    options.repacker.batch_timeout = Duration::from_millis(10);

    Engine::start(&options).expect("engine starts")
}

pub fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").expect("bind client socket")
}

/// A minimal valid record with the given script name and request time.
pub fn record(script: &str, request_time: f32) -> WireRequest {
    WireRequest {
        hostname: "web01".to_string(),
        server_name: "example.com".to_string(),
        script_name: script.to_string(),
        request_count: 1,
        document_size: 0,
        memory_peak: 0,
        request_time,
        ru_utime: 0.0,
        ru_stime: 0.0,
        status: Some(200),
        schema: Some("http".to_string()),
        ..Default::default()
    }
}

pub fn send_record(sock: &UdpSocket, addr: SocketAddr, r: &WireRequest) {
    let mut payload = Vec::new();
    r.encode(&mut payload).expect("encode");
    sock.send_to(&payload, addr).expect("send");
}

/// Polls `check` until it returns `Some(T)` or the timeout elapses.
pub fn wait_for<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not met in {timeout:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
}
