//! In-process mock backend.
//!
//! Binds the instance address and echoes whatever it receives. Used for
//! local development (`--backend mock`) and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, InstanceHandle, InstanceSpec};
use crate::shutdown::wait_for_shutdown;

/// Mock backend for testing and development.
pub struct MockBackend {
    /// Number of successful starts.
    starts: AtomicU64,

    /// Whether instances should "fail" to start.
    fail_starts: bool,

    /// Whether each connection is greeted with the region code.
    announce_region: bool,
}

impl MockBackend {
    /// Create a mock backend that echoes.
    pub fn new() -> Self {
        Self {
            starts: AtomicU64::new(0),
            fail_starts: false,
            announce_region: false,
        }
    }

    /// Create a mock backend that writes `"<REGION>\n"` to every new
    /// connection before echoing.
    pub fn announcing() -> Self {
        Self {
            announce_region: true,
            ..Self::new()
        }
    }

    /// Create a mock backend that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Number of instances started so far.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle, BackendError> {
        if self.fail_starts {
            return Err(BackendError::Rejected(
                "mock backend configured to fail".to_string(),
            ));
        }

        let listener = TcpListener::bind(spec.addr)
            .await
            .map_err(|source| BackendError::Bind {
                addr: spec.addr,
                source,
            })?;
        self.starts.fetch_add(1, Ordering::SeqCst);

        info!(
            region = %spec.region,
            addr = %spec.addr,
            generation = spec.generation,
            "[MOCK] Backend listening"
        );

        let greeting = self
            .announce_region
            .then(|| format!("{}\n", spec.region).into_bytes());
        let spec = *spec;

        Ok(InstanceHandle::spawn(spec, move |mut cancel| async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut cancel) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            connections.spawn(echo(stream, greeting.clone()));
                        }
                        Err(e) => {
                            warn!(addr = %spec.addr, error = %e, "[MOCK] Accept error");
                        }
                    },
                }
                while connections.try_join_next().is_some() {}
            }

            drop(listener);
            connections.shutdown().await;
            debug!(
                region = %spec.region,
                generation = spec.generation,
                "[MOCK] Backend released address"
            );
            Ok(())
        }))
    }
}

async fn echo(mut stream: TcpStream, greeting: Option<Vec<u8>>) {
    if let Some(greeting) = greeting {
        if stream.write_all(&greeting).await.is_err() {
            return;
        }
    }

    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuffle_regions::RegionCode;

    async fn free_addr() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn spec(addr: std::net::SocketAddr, generation: u64) -> InstanceSpec {
        InstanceSpec {
            region: RegionCode::new("JP").unwrap(),
            addr,
            generation,
        }
    }

    #[tokio::test]
    async fn test_echo_and_release() {
        let addr = free_addr().await;
        let backend = MockBackend::announcing();

        let handle = backend.start(&spec(addr, 1)).await.unwrap();
        assert_eq!(backend.start_count(), 1);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"JP\n");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        handle.stop().await.unwrap();

        // The open connection is closed and the address can be rebound.
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        let next = backend.start(&spec(addr, 2)).await.unwrap();
        next.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let addr = free_addr().await;
        let backend = MockBackend::failing();
        let result = backend.start(&spec(addr, 1)).await;
        assert!(matches!(result, Err(BackendError::Rejected(_))));
        assert_eq!(backend.start_count(), 0);
    }

    #[tokio::test]
    async fn test_address_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();
        let result = MockBackend::new().start(&spec(addr, 1)).await;
        assert!(matches!(result, Err(BackendError::Bind { .. })));
    }
}
