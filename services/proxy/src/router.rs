//! Connection router.
//!
//! Picks a backend address round-robin and relays bytes transparently
//! between the client and the backend. There is no retry against another
//! backend when the dial fails.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::shutdown::wait_for_shutdown;

/// Size of the relay copy buffer per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// One round-robin pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Global connection sequence number.
    pub seq: u64,
    /// Index into the address pool (`seq mod N`).
    pub index: usize,
    pub addr: SocketAddr,
}

/// Which side ended a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client to backend direction finished first.
    Client,
    /// Backend to client direction finished first.
    Backend,
    /// Shutdown closed both sides.
    Shutdown,
}

/// Byte counts for one relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub ended_by: RelayEnd,
}

/// Result of routing one connection.
#[derive(Debug)]
pub enum RouteOutcome {
    /// The backend was reached and the relay has finished.
    Relayed {
        selection: Selection,
        stats: RelayStats,
    },
    /// The selected backend could not be dialed; the client was closed.
    DialFailed {
        selection: Selection,
        error: io::Error,
    },
    /// Shutdown was signaled before the backend answered.
    Cancelled { selection: Selection },
    /// The pool has no addresses.
    NoBackends,
}

/// Round-robin router over a fixed address pool.
#[derive(Debug)]
pub struct Router {
    addresses: Arc<[SocketAddr]>,
    cursor: AtomicU64,
}

impl Router {
    /// Create a router over a fixed address list.
    pub fn new(addresses: Arc<[SocketAddr]>) -> Self {
        Self {
            addresses,
            cursor: AtomicU64::new(0),
        }
    }

    /// Number of backend addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Connections routed so far (the next sequence number).
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Take the next sequence number and map it onto the pool.
    pub fn select(&self) -> Option<Selection> {
        let len = self.addresses.len();
        if len == 0 {
            return None;
        }

        let seq = self.cursor.fetch_add(1, Ordering::Relaxed);
        let index = (seq % len as u64) as usize;
        Some(Selection {
            seq,
            index,
            addr: self.addresses[index],
        })
    }

    /// Route one inbound connection until either side closes or shutdown
    /// is signaled.
    pub async fn route(
        &self,
        mut client: TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> RouteOutcome {
        let Some(selection) = self.select() else {
            warn!("No backends in pool");
            return RouteOutcome::NoBackends;
        };

        debug!(
            seq = selection.seq,
            index = selection.index,
            backend_addr = %selection.addr,
            "Forwarding connection"
        );

        let dialed = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => None,
            dialed = TcpStream::connect(selection.addr) => Some(dialed),
        };

        let mut backend = match dialed {
            None => return RouteOutcome::Cancelled { selection },
            Some(Ok(stream)) => stream,
            Some(Err(error)) => {
                warn!(
                    seq = selection.seq,
                    backend_addr = %selection.addr,
                    error = %error,
                    "Failed to connect to backend"
                );
                return RouteOutcome::DialFailed { selection, error };
            }
        };

        let stats = relay(&mut client, &mut backend, &mut shutdown).await;

        debug!(
            seq = selection.seq,
            backend_addr = %selection.addr,
            bytes_to_backend = stats.bytes_to_backend,
            bytes_from_backend = stats.bytes_from_backend,
            ended_by = ?stats.ended_by,
            "Connection closed"
        );

        RouteOutcome::Relayed { selection, stats }
    }
}

/// Relay bytes in both directions until one direction ends.
///
/// When either copy finishes (EOF or error) or shutdown is signaled, the
/// other copy is dropped and both streams are closed by the caller.
pub async fn relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> RelayStats {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let mut bytes_to_backend = 0u64;
    let mut bytes_from_backend = 0u64;

    let ended_by = {
        let to_backend = copy_counted(&mut client_read, &mut backend_write, &mut bytes_to_backend);
        let from_backend =
            copy_counted(&mut backend_read, &mut client_write, &mut bytes_from_backend);

        tokio::select! {
            _ = wait_for_shutdown(shutdown) => RelayEnd::Shutdown,
            result = to_backend => {
                if let Err(e) = result {
                    debug!(error = %e, "Client to backend copy failed");
                }
                RelayEnd::Client
            }
            result = from_backend => {
                if let Err(e) = result {
                    debug!(error = %e, "Backend to client copy failed");
                }
                RelayEnd::Backend
            }
        }
    };

    RelayStats {
        bytes_to_backend,
        bytes_from_backend,
        ended_by,
    }
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
    writer.flush().await
}
