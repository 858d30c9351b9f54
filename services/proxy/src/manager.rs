//! Pool manager.
//!
//! Owns the region pool, one supervisor per region, the public listener and
//! the shared shutdown scope. `start` runs everything until `stop` is
//! called.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shuffle_regions::RegionPool;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::backend::Backend;
use crate::router::Router;
use crate::shutdown::{sleep_or_shutdown, wait_for_shutdown};
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorStatus, DEFAULT_REFRESH_PERIOD};

/// Default public bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:1080";

/// Default wait between launching supervisors and opening the listener.
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(2);

/// Default bound on waiting for supervisors and relays at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Back-off after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The public listener could not be opened.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `start` was called more than once.
    #[error("manager already started")]
    AlreadyStarted,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Public listener address.
    pub bind_addr: SocketAddr,
    /// Time between backend refreshes, per region.
    pub refresh_period: Duration,
    /// Readiness allowance before the listener is opened.
    pub warmup: Duration,
    /// How long `start` waits for relays and supervisors to finish once
    /// shutdown is signaled. One deadline covers both.
    pub shutdown_grace: Duration,
    /// Relaunch a backend as soon as it exits on its own.
    pub relaunch_on_exit: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1080)),
            refresh_period: DEFAULT_REFRESH_PERIOD,
            warmup: DEFAULT_WARMUP,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            relaunch_on_exit: false,
        }
    }
}

/// Manages a pool of region backends behind one listener.
pub struct Manager<B: Backend> {
    config: ManagerConfig,
    pool: RegionPool,
    router: Arc<Router>,
    /// Supervisors waiting for `start`.
    pending: Mutex<Vec<Supervisor<B>>>,
    statuses: Vec<watch::Receiver<SupervisorStatus>>,
    shutdown_tx: watch::Sender<bool>,
    listening_tx: watch::Sender<Option<SocketAddr>>,
}

impl<B: Backend> Manager<B> {
    /// Create a manager; nothing runs until `start`.
    pub fn new(config: ManagerConfig, pool: RegionPool, backend: Arc<B>) -> Self {
        let supervisor_config = SupervisorConfig {
            refresh_period: config.refresh_period,
            relaunch_on_exit: config.relaunch_on_exit,
        };

        let supervisors: Vec<Supervisor<B>> = pool
            .entries()
            .map(|entry| {
                Supervisor::new(entry, pool.len(), &supervisor_config, Arc::clone(&backend))
            })
            .collect();
        let statuses = supervisors.iter().map(Supervisor::subscribe).collect();

        let (shutdown_tx, _) = watch::channel(false);
        let (listening_tx, _) = watch::channel(None);

        Self {
            router: Arc::new(Router::new(pool.addresses())),
            config,
            pool,
            pending: Mutex::new(supervisors),
            statuses,
            shutdown_tx,
            listening_tx,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn pool(&self) -> &RegionPool {
        &self.pool
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Address of the public listener while it is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.listening_tx.borrow()
    }

    /// Watch the public listener address (`None` while closed).
    pub fn listening(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.listening_tx.subscribe()
    }

    /// Current status of every supervisor, in pool order.
    pub fn statuses(&self) -> Vec<SupervisorStatus> {
        self.statuses.iter().map(|rx| *rx.borrow()).collect()
    }

    /// Subscribe to the shared shutdown scope.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Run the pool until `stop` is called.
    ///
    /// Returns an error only if the listener cannot be opened; in that case
    /// the supervisors already launched are stopped first.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let supervisors = std::mem::take(&mut *self.pending.lock().await);
        if supervisors.is_empty() {
            return Err(ManagerError::AlreadyStarted);
        }

        info!(
            regions = self.pool.len(),
            base_port = self.pool.base_port(),
            bind_addr = %self.config.bind_addr,
            refresh_secs = self.config.refresh_period.as_secs(),
            "Starting shuffle mode"
        );

        let tasks: Vec<JoinHandle<()>> = supervisors
            .into_iter()
            .map(|supervisor| tokio::spawn(supervisor.run(self.shutdown_tx.subscribe())))
            .collect();

        let mut shutdown = self.shutdown_tx.subscribe();
        if !sleep_or_shutdown(self.config.warmup, &mut shutdown).await {
            self.join_supervisors(tasks, self.grace_deadline()).await;
            return Ok(());
        }

        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(
                    bind_addr = %self.config.bind_addr,
                    error = %source,
                    "Failed to bind listener"
                );
                self.stop();
                self.join_supervisors(tasks, self.grace_deadline()).await;
                return Err(ManagerError::Bind {
                    addr: self.config.bind_addr,
                    source,
                });
            }
        };

        let local_addr = listener.local_addr().unwrap_or(self.config.bind_addr);
        self.listening_tx.send_replace(Some(local_addr));
        info!(
            listen_addr = %local_addr,
            backends = self.router.len(),
            "Shuffle mode load balancer started"
        );

        let connections = self.accept_loop(listener, &mut shutdown).await;
        self.listening_tx.send_replace(None);

        let deadline = self.grace_deadline();
        self.drain_connections(connections, deadline).await;
        self.join_supervisors(tasks, deadline).await;
        info!(routed = self.router.cursor(), "Shuffle mode stopped");
        Ok(())
    }

    /// Close the listener and signal every supervisor and relay to stop.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutting down shuffle mode");
        }
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        shutdown: &mut watch::Receiver<bool>,
    ) -> JoinSet<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let router = Arc::clone(&self.router);
                        let conn_shutdown = self.shutdown_tx.subscribe();
                        connections.spawn(
                            async move {
                                router.route(stream, conn_shutdown).await;
                            }
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }

            while let Some(result) = connections.try_join_next() {
                if let Err(e) = result {
                    warn!(error = %e, "Connection task failed");
                }
            }
        }

        drop(listener);
        debug!(in_flight = connections.len(), "Listener closed");
        connections
    }

    fn grace_deadline(&self) -> Instant {
        Instant::now() + self.config.shutdown_grace
    }

    async fn drain_connections(&self, mut connections: JoinSet<()>, deadline: Instant) {
        let drained = tokio::time::timeout_at(deadline, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections still open after shutdown grace, aborting"
            );
            connections.shutdown().await;
        }
    }

    async fn join_supervisors(&self, tasks: Vec<JoinHandle<()>>, deadline: Instant) {
        let abort: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout_at(deadline, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Supervisor task failed");
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!("Supervisors still running after shutdown grace, aborting");
            for handle in abort {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockBackend;
    use shuffle_regions::RegionCode;

    fn pool(codes: &[&str]) -> RegionPool {
        let regions = codes.iter().map(|c| RegionCode::new(c).unwrap()).collect();
        RegionPool::new(regions, 11000).unwrap()
    }

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.refresh_period, Duration::from_secs(900));
        assert_eq!(config.warmup, Duration::from_secs(2));
        assert!(!config.relaunch_on_exit);
    }

    #[test]
    fn test_new_manager_has_one_supervisor_per_region() {
        let manager = Manager::new(
            ManagerConfig::default(),
            pool(&["DE", "US", "JP"]),
            Arc::new(MockBackend::new()),
        );

        let statuses = manager.statuses();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[2].region.as_str(), "JP");
        assert_eq!(statuses[2].addr.port(), 11002);
        assert_eq!(manager.router().len(), 3);
        assert!(manager.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_stop_during_warmup() {
        let config = ManagerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            warmup: Duration::from_secs(3600),
            refresh_period: Duration::from_secs(3600),
            ..ManagerConfig::default()
        };
        let manager = Arc::new(Manager::new(
            config,
            pool(&["DE", "US"]),
            Arc::new(MockBackend::new()),
        ));

        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.start().await }
        });
        manager.stop();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(manager.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let config = ManagerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            warmup: Duration::ZERO,
            refresh_period: Duration::from_secs(3600),
            ..ManagerConfig::default()
        };
        let manager = Manager::new(config, pool(&["DE"]), Arc::new(MockBackend::new()));
        manager.stop();
        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(ManagerError::AlreadyStarted)
        ));
    }
}
