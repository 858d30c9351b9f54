//! Manager shutdown and listener failure.


use std::sync::Arc;
use std::time::Duration;

use harness::{read_tag, regions, reserve_base_port, ManagerHandle, StuckBackend};
use shuffle_proxy::{GenerationState, Manager, ManagerConfig, ManagerError, MockBackend};
use shuffle_regions::RegionPool;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

#[tokio::test]
async fn test_stop_closes_listener_relays_and_backends() {
    // IE launches at 2s; no refresh happens before 4s.
    let handle = ManagerHandle::spawn(
        &["GB", "IE"],
        Duration::from_secs(4),
        Arc::new(MockBackend::announcing()),
    )
    .await;
    let statuses = handle.wait_all_running().await;
    let backend_addrs: Vec<_> = statuses.iter().map(|s| s.addr).collect();
    let listen_addr = handle.listen_addr;
    let manager = Arc::clone(&handle.manager);

    // Hold an open relay across shutdown.
    let (tag, mut open) = read_tag(listen_addr).await.unwrap();
    assert_eq!(tag, "GB");

    handle.stop().await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), open.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "relay should be closed");

    assert!(TcpStream::connect(listen_addr).await.is_err());
    assert!(manager.local_addr().is_none());

    for status in manager.statuses() {
        assert_eq!(status.state, GenerationState::Stopped);
        assert_eq!(status.generation, 1);
    }
    for addr in backend_addrs {
        assert!(
            std::net::TcpListener::bind(addr).is_ok(),
            "{} still held after shutdown",
            addr
        );
    }
}

#[tokio::test]
async fn test_bind_failure_stops_supervisors() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_port = reserve_base_port(2);
    let pool = RegionPool::new(regions(&["CH", "NO"]), base_port).unwrap();

    let backend = Arc::new(MockBackend::new());
    let config = ManagerConfig {
        bind_addr: occupied.local_addr().unwrap(),
        refresh_period: Duration::from_secs(3600),
        warmup: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
        relaunch_on_exit: false,
    };
    let manager = Manager::new(config, pool, Arc::clone(&backend));

    let result = timeout(Duration::from_secs(5), manager.start())
        .await
        .unwrap();
    assert!(matches!(result, Err(ManagerError::Bind { .. })));

    // NO is staggered by half an hour and never launches.
    assert_eq!(backend.start_count(), 1);
    let statuses = manager.statuses();
    assert_eq!(statuses[0].generation, 1);
    assert_eq!(statuses[1].generation, 0);
    for status in statuses {
        assert_eq!(status.state, GenerationState::Stopped);
        assert!(std::net::TcpListener::bind(status.addr).is_ok());
    }
}

#[tokio::test]
async fn test_shutdown_grace_bounds_stop() {
    let handle = ManagerHandle::spawn_with_grace(
        &["LV"],
        Duration::from_secs(3600),
        Duration::from_millis(300),
        Arc::new(StuckBackend),
    )
    .await;
    handle.wait_all_running().await;

    // The supervisor never finishes releasing, so only the grace ends `start`.
    let started = Instant::now();
    handle.stop().await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "stopped after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "stopped after {:?}", elapsed);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let handle = ManagerHandle::spawn(
        &["FI"],
        Duration::from_secs(3600),
        Arc::new(MockBackend::new()),
    )
    .await;
    handle.manager.stop();
    handle.manager.stop();
    handle.stop().await.unwrap();
}
