//! End-to-end relay tests over loopback
//!
//! Each test drives the router through its real interfaces: Host
//! Records arrive over the rendezvous socket, and teardown is signalled
//! by releasing the tunnel's advisory lock, exactly as a live helper
//! would.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::time::{sleep, timeout};

use tr_core::lockfile::LockFile;
use tr_core::paths;
use tr_core::types::{ClientConfig, Host};
use tr_router::router::Router;
use tr_router::service::ServiceSpec;

/// Each test gets unique front-end ports and fake tunnel pids; the
/// tunnel lock files live in the real run path.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);
static PID_COUNTER: AtomicI32 = AtomicI32::new(0);

fn frontend_port() -> u16 {
    47310 + PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn tunnel_pid() -> i32 {
    900_000_000 + PID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn host_record(pid: i32, listen_port: u16, uid: u32) -> Host {
    Host {
        listen_port: listen_port as u32,
        remote_ip: "10.0.0.5".to_string(),
        remote_port: 33000,
        config: ClientConfig {
            port: 8080,
            instance: 1,
            label: "a".to_string(),
        },
        uid: uid as i32,
        uname: String::new(),
        pid,
    }
}

/// Hold the tunnel advisory lock the way a live helper does.
fn hold_lock(pid: i32) -> LockFile {
    LockFile::lock_exclusive(&paths::tunnel_lock(pid)).expect("acquire tunnel lock")
}

async fn deliver(socket: &Path, host: &Host) {
    deliver_raw(socket, &serde_json::to_vec(host).unwrap()).await;
}

async fn deliver_raw(socket: &Path, payload: &[u8]) {
    let mut stream = UnixStream::connect(socket)
        .await
        .expect("connect rendezvous socket");
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

fn rendezvous_path() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("router.sock");
    (dir, socket)
}

/// Backend that answers every connection with a fixed tag and closes.
async fn spawn_tagged_backend(tag: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let _ = conn.write_all(tag.as_bytes()).await;
        }
    });
    port
}

/// Backend that echoes whatever it receives.
async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn read_tag(addr: SocketAddr) -> String {
    let mut conn = TcpStream::connect(addr).await.expect("connect front-end");
    let mut tag = String::new();
    conn.read_to_string(&mut tag).await.unwrap();
    tag
}

#[tokio::test]
async fn test_single_backend_round_trip() {
    let (_dir, socket) = rendezvous_path();
    let backend = spawn_echo_backend().await;
    let port = frontend_port();
    let uid = 81001;

    let router = Router::new(socket.clone(), None);
    let spec = ServiceSpec::parse(&format!("api:8080@local:>{port}")).unwrap();
    let service = router.add_service(spec, uid).unwrap();
    router.seal();
    tokio::spawn(router.run());
    wait_until("rendezvous socket", || socket.exists()).await;

    let pid = tunnel_pid();
    let _lock = hold_lock(pid);
    deliver(&socket, &host_record(pid, backend, uid)).await;
    wait_until("front-end listener", || service.frontend_addr().is_some()).await;

    let mut client = TcpStream::connect(service.frontend_addr().unwrap())
        .await
        .unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_round_robin_across_three_backends() {
    let (_dir, socket) = rendezvous_path();
    let backends = [
        spawn_tagged_backend("b1").await,
        spawn_tagged_backend("b2").await,
        spawn_tagged_backend("b3").await,
    ];
    let port = frontend_port();
    let uid = 81002;

    let router = Router::new(socket.clone(), None);
    let spec = ServiceSpec::parse(&format!("svc:*@local:>{port}")).unwrap();
    let service = router.add_service(spec, uid).unwrap();
    router.seal();
    tokio::spawn(router.run());
    wait_until("rendezvous socket", || socket.exists()).await;

    let mut locks = Vec::new();
    for (count, backend) in backends.into_iter().enumerate() {
        let pid = tunnel_pid();
        locks.push(hold_lock(pid));
        deliver(&socket, &host_record(pid, backend, uid)).await;
        wait_until("endpoint registered", || {
            service.registry().len() == count + 1
        })
        .await;
    }

    let addr = service.frontend_addr().unwrap();
    for expected in ["b1", "b2", "b3", "b1"] {
        assert_eq!(read_tag(addr).await, expected);
    }
}

#[tokio::test]
async fn test_eviction_on_dial_failure() {
    let (_dir, socket) = rendezvous_path();
    let alive1 = spawn_tagged_backend("b1").await;
    let dead = {
        // bound then dropped: connections to this port are refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let alive3 = spawn_tagged_backend("b3").await;
    let port = frontend_port();
    let uid = 81003;

    let router = Router::new(socket.clone(), None);
    let spec = ServiceSpec::parse(&format!("svc:*@local:>{port}")).unwrap();
    let service = router.add_service(spec, uid).unwrap();
    router.seal();
    tokio::spawn(router.run());
    wait_until("rendezvous socket", || socket.exists()).await;

    let mut locks = Vec::new();
    let mut pids = Vec::new();
    for (count, backend) in [alive1, dead, alive3].into_iter().enumerate() {
        let pid = tunnel_pid();
        pids.push(pid);
        locks.push(hold_lock(pid));
        deliver(&socket, &host_record(pid, backend, uid)).await;
        wait_until("endpoint registered", || {
            service.registry().len() == count + 1
        })
        .await;
    }

    let addr = service.frontend_addr().unwrap();
    assert_eq!(read_tag(addr).await, "b1");
    // this turn lands on the dead endpoint, which is evicted mid-request
    assert_eq!(read_tag(addr).await, "b3");
    assert_eq!(read_tag(addr).await, "b1");

    assert_eq!(service.registry().len(), 2);
    assert_eq!(service.registry().pids(), vec![pids[0], pids[2]]);
}

#[tokio::test]
async fn test_listener_lifecycle() {
    let (_dir, socket) = rendezvous_path();
    let backend = spawn_tagged_backend("b1").await;
    let port = frontend_port();
    let uid = 81004;

    let router = Router::new(socket.clone(), None);
    let spec = ServiceSpec::parse(&format!("svc:*@local:>{port}")).unwrap();
    let service = router.add_service(spec, uid).unwrap();
    router.seal();
    tokio::spawn(router.run());
    wait_until("rendezvous socket", || socket.exists()).await;

    // first attach binds the listener
    let pid = tunnel_pid();
    let lock = hold_lock(pid);
    deliver(&socket, &host_record(pid, backend, uid)).await;
    wait_until("front-end bound", || service.frontend_addr().is_some()).await;
    let addr = service.frontend_addr().unwrap();
    assert_eq!(read_tag(addr).await, "b1");

    // last detach closes it
    drop(lock);
    wait_until("front-end closed", || service.frontend_addr().is_none()).await;
    wait_until("connections refused", || {
        std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_err()
    })
    .await;

    // a new attach rebinds at the same address
    let pid = tunnel_pid();
    let _lock = hold_lock(pid);
    deliver(&socket, &host_record(pid, backend, uid)).await;
    wait_until("front-end rebound", || service.frontend_addr().is_some()).await;
    assert_eq!(service.frontend_addr().unwrap(), addr);
    assert_eq!(read_tag(addr).await, "b1");
}

#[tokio::test]
async fn test_readiness_barrier_across_two_services() {
    let (_dir, socket) = rendezvous_path();
    let uid_a = 81005;
    let uid_b = 81006;

    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    let router = Router::new(
        socket.clone(),
        Some(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })),
    );
    let service_a = router
        .add_service(ServiceSpec::parse("alpha:*").unwrap(), uid_a)
        .unwrap();
    let service_b = router
        .add_service(ServiceSpec::parse("beta:*").unwrap(), uid_b)
        .unwrap();
    router.seal();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    tokio::spawn(router.run());
    wait_until("rendezvous socket", || socket.exists()).await;

    let pid = tunnel_pid();
    let _lock_a = hold_lock(pid);
    deliver(&socket, &host_record(pid, 40001, uid_a)).await;
    wait_until("service A endpoint", || service_a.registry().len() == 1).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    let pid = tunnel_pid();
    let _lock_b = hold_lock(pid);
    deliver(&socket, &host_record(pid, 40002, uid_b)).await;
    wait_until("readiness callback", || fired.load(Ordering::SeqCst) == 1).await;

    // further attaches do not refire
    let pid = tunnel_pid();
    let _lock_a2 = hold_lock(pid);
    deliver(&socket, &host_record(pid, 40003, uid_a)).await;
    wait_until("second service A endpoint", || service_a.registry().len() == 2).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(service_b.registry().len(), 1);
}

#[tokio::test]
async fn test_malformed_record_is_isolated() {
    let (_dir, socket) = rendezvous_path();
    let uid = 81007;

    let router = Router::new(socket.clone(), None);
    let service = router
        .add_service(ServiceSpec::parse("svc:*").unwrap(), uid)
        .unwrap();
    router.seal();
    tokio::spawn(router.run());
    wait_until("rendezvous socket", || socket.exists()).await;

    deliver_raw(&socket, b"not json at all").await;
    // a record for an unconfigured uid is dropped too
    let stray = tunnel_pid();
    let _stray_lock = hold_lock(stray);
    deliver(&socket, &host_record(stray, 40001, 65000)).await;

    let pid = tunnel_pid();
    let _lock = hold_lock(pid);
    deliver(&socket, &host_record(pid, 40002, uid)).await;
    wait_until("valid record accepted", || service.registry().len() == 1).await;
    assert_eq!(service.registry().pids(), vec![pid]);
}
