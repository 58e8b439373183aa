#![deny(rust_2018_idioms)]

use std::io::{Read, Seek, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, StatusCode};
use stoker::{AppBody, BoxError, Config, Environ, Response, Worker, WorkerHandle};

#[test]
fn serves_a_simple_get() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);

    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.ends_with("hello world"), "{resp}");
}

#[test]
fn keepalive_reuse_across_requests() {
    // scenario: threads=4, worker_connections=8, keepalive=5
    let cfg = Config::builder()
        .threads(4)
        .worker_connections(8)
        .keepalive(Duration::from_secs(5))
        .build()
        .unwrap();
    let server = serve(cfg);
    let mut sock = server.connect();

    for _ in 0..3 {
        sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let resp = read_response(&mut sock);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
        assert!(resp.contains("Connection: keep-alive\r\n"), "{resp}");
    }

    // between requests the connection sits in the keepalive set,
    // registered with the poller
    wait_until(
        || server.handle.idle_connections() == 1,
        Duration::from_secs(2),
        "connection parked in the keepalive set",
    );

    drop(sock);
    wait_until(
        || server.handle.active_connections() == 0,
        Duration::from_secs(3),
        "client close observed",
    );
}

#[test]
fn pipelined_requests_on_one_socket() {
    let cfg = Config::builder()
        .threads(4)
        .worker_connections(8)
        .keepalive(Duration::from_secs(5))
        .build()
        .unwrap();
    let server = serve(cfg);
    let mut sock = server.connect();

    sock.write_all(
        b"GET / HTTP/1.1\r\nHost: t\r\n\r\n\
          GET / HTTP/1.1\r\nHost: t\r\n\r\n\
          GET / HTTP/1.1\r\nHost: t\r\n\r\n",
    )
    .unwrap();

    for _ in 0..3 {
        let resp = read_response(&mut sock);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    }
}

#[test]
fn keepalive_timeout_closes_idle_connection() {
    let cfg = Config::builder()
        .threads(2)
        .worker_connections(8)
        .keepalive(Duration::from_secs(1))
        .build()
        .unwrap();
    let server = serve(cfg);
    let mut sock = server.connect();

    sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");

    // server-initiated close once the deadline passes
    let mut buf = [0u8; 32];
    let n = sock.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected server-side close");

    wait_until(
        || server.handle.active_connections() == 0,
        Duration::from_secs(2),
        "reaper released the connection",
    );
}

#[test]
fn backpressure_waits_for_capacity() {
    // threads=1, worker_connections=1: a second client queues in the
    // kernel backlog until the first turn finishes
    let cfg = Config::builder()
        .threads(1)
        .worker_connections(1)
        .keepalive(Duration::ZERO)
        .build()
        .unwrap();
    let server = serve(cfg);

    let addr = server.addr;
    let started = Instant::now();
    let slow = thread::spawn(move || {
        let mut sock = TcpStream::connect(addr).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        sock.write_all(b"GET /slow HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
        read_response(&mut sock)
    });

    // make sure the slow request is in flight first
    thread::sleep(Duration::from_millis(150));

    let mut sock = server.connect();
    sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);
    let elapsed = started.elapsed();

    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(
        elapsed >= Duration::from_millis(500),
        "second client served before capacity freed: {elapsed:?}"
    );

    let slow_resp = slow.join().unwrap();
    assert!(slow_resp.starts_with("HTTP/1.1 200 OK\r\n"), "{slow_resp}");
}

#[test]
fn max_requests_retires_the_worker() {
    let cfg = Config::builder()
        .threads(2)
        .worker_connections(8)
        .keepalive(Duration::from_secs(5))
        .max_requests(2)
        .graceful_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let mut server = serve(cfg);
    let mut sock = server.connect();

    sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let first = read_response(&mut sock);
    assert!(first.contains("Connection: keep-alive\r\n"), "{first}");

    sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let second = read_response(&mut sock);
    assert!(second.contains("Connection: close\r\n"), "{second}");

    // the worker retires on its own after the budgeted request
    let result = server.join();
    assert!(result.is_ok());
}

#[test]
fn beacon_advances_while_running_and_stops_after_quit() {
    let mut server = serve(base_cfg());

    let first = server.handle.last_heartbeat().unwrap();
    thread::sleep(Duration::from_millis(1300));
    let second = server.handle.last_heartbeat().unwrap();
    assert!(second > first, "beacon stalled while running");

    server.handle.quit();
    server.join().unwrap();

    let third = server.handle.last_heartbeat().unwrap();
    thread::sleep(Duration::from_millis(1200));
    let fourth = server.handle.last_heartbeat().unwrap();
    assert_eq!(third, fourth, "beacon advanced after the worker quit");
}

#[test]
fn app_error_turns_into_500() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    sock.write_all(b"GET /fail HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);

    assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{resp}");
    assert!(resp.contains("Connection: close\r\n"), "{resp}");
}

#[test]
fn malformed_request_turns_into_400() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    sock.write_all(b"!!!bogus\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);

    assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{resp}");
}

#[test]
fn echoes_a_request_body_and_stays_reusable() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    sock.write_all(b"POST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 12\r\n\r\nhello stoker")
        .unwrap();
    let resp = read_response(&mut sock);
    assert!(resp.ends_with("hello stoker"), "{resp}");

    // the body was consumed, so the connection survives for another turn
    sock.write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
}

#[test]
fn unread_body_forces_close() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    // the default handler never reads the body
    sock.write_all(b"POST / HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nxxxxx")
        .unwrap();
    let resp = read_response(&mut sock);
    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");

    let mut buf = [0u8; 16];
    let n = sock.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected close after unread body");
}

#[test]
fn chunked_response_when_no_length_is_declared() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    sock.write_all(b"GET /chunky HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);

    assert!(resp.contains("Transfer-Encoding: chunked\r\n"), "{resp}");
    assert!(resp.contains("3\r\none\r\n"), "{resp}");
    assert!(resp.contains("3\r\ntwo\r\n"), "{resp}");
    assert!(resp.ends_with("0\r\n\r\n"), "{resp}");
}

#[test]
fn file_bodies_use_the_fast_path() {
    let server = serve(base_cfg());
    let mut sock = server.connect();

    sock.write_all(b"GET /file HTTP/1.1\r\nHost: t\r\n\r\n").unwrap();
    let resp = read_response(&mut sock);

    assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "{resp}");
    assert!(resp.contains("content-length: 13\r\n"), "{resp}");
    assert!(resp.ends_with("file contents"), "{resp}");
}

#[test]
fn quit_stops_quickly() {
    let mut server = serve(base_cfg());
    let started = Instant::now();
    server.handle.quit();
    server.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
}

// ===== support =====

fn base_cfg() -> Config {
    Config::builder()
        .threads(2)
        .worker_connections(16)
        .keepalive(Duration::from_secs(5))
        .graceful_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

fn test_app(env: &mut Environ<'_>, resp: &mut Response) -> Result<AppBody, BoxError> {
    let path = env.request().uri().path().to_owned();
    match path.as_str() {
        "/slow" => {
            thread::sleep(Duration::from_millis(600));
            fixed(resp, "slept")
        }
        "/echo" => {
            let mut body = Vec::new();
            env.body().read_to_end(&mut body)?;
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            resp.start_response(StatusCode::OK, headers);
            Ok(AppBody::from(body))
        }
        "/fail" => Err("kaboom".into()),
        "/chunky" => {
            resp.start_response(StatusCode::OK, HeaderMap::new());
            let chunks = vec![
                Ok(bytes::Bytes::from_static(b"one")),
                Ok(bytes::Bytes::from_static(b"two")),
            ];
            Ok(AppBody::Iter(Box::new(chunks.into_iter())))
        }
        "/file" => {
            let mut file = tempfile::tempfile()?;
            file.write_all(b"file contents")?;
            file.rewind()?;
            resp.start_response(StatusCode::OK, HeaderMap::new());
            Ok(AppBody::file(file))
        }
        _ => fixed(resp, "hello world"),
    }
}

fn fixed(resp: &mut Response, body: &str) -> Result<AppBody, BoxError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    resp.start_response(StatusCode::OK, headers);
    Ok(AppBody::from(body.to_owned()))
}

struct TestServer {
    addr: SocketAddr,
    handle: WorkerHandle,
    thread: Option<JoinHandle<stoker::Result<()>>>,
}

fn serve(cfg: Config) -> TestServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let worker = Worker::new(cfg, test_app, vec![listener]).unwrap();
    let handle = worker.handle();
    let thread = thread::spawn(move || worker.run());
    TestServer {
        addr,
        handle,
        thread: Some(thread),
    }
}

impl TestServer {
    fn connect(&self) -> TcpStream {
        let sock = TcpStream::connect(self.addr).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        sock
    }

    fn join(&mut self) -> stoker::Result<()> {
        self.thread
            .take()
            .expect("worker already joined")
            .join()
            .expect("worker thread panicked")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.graceful_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Read one full response: head, then a content-length or chunked body.
fn read_response(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = sock.read(&mut tmp).unwrap();
        assert!(
            n > 0,
            "connection closed before response head: {:?}",
            String::from_utf8_lossy(&buf)
        );
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    if head.contains("transfer-encoding: chunked") {
        while !buf.ends_with(b"0\r\n\r\n") {
            let n = sock.read(&mut tmp).unwrap();
            assert!(n > 0, "connection closed mid chunked body");
            buf.extend_from_slice(&tmp[..n]);
        }
        return String::from_utf8_lossy(&buf).into_owned();
    }

    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    while buf.len() < head_end + length {
        let n = sock.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed mid body");
        buf.extend_from_slice(&tmp[..n]);
    }
    String::from_utf8_lossy(&buf[..head_end + length]).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn wait_until(cond: impl Fn() -> bool, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for: {what}");
}
