//! Backend supervisor - owns one region's sequence of generations.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --(stagger)--> Starting(1) -> Running(1)
//!      --(tick)-----> Draining(1) -> Released(1) -> Starting(2) -> Running(2)
//!      ...
//!      --(shutdown)-> Draining(k) -> Released(k) -> Stopped
//! ```
//!
//! A new generation is only started after the previous one has confirmed
//! that it released the region's address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shuffle_regions::{PoolEntry, RegionCode};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError, InstanceHandle, InstanceSpec};
use crate::schedule::RefreshSchedule;
use crate::shutdown::{sleep_or_shutdown, wait_for_shutdown};

/// Default refresh period.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Pause before relaunching a generation that exited on its own.
pub const RELAUNCH_BACKOFF: Duration = Duration::from_secs(1);

/// State of the supervisor's current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Waiting for the stagger delay.
    Idle,
    /// Backend start in progress.
    Starting,
    /// Generation is serving its address.
    Running,
    /// Generation was asked to stop and still holds its address.
    Draining,
    /// Generation stopped and released its address.
    Released,
    /// Start failed or the generation exited on its own; waiting for the
    /// next tick.
    Failed,
    /// Supervisor has exited.
    Stopped,
}

/// Snapshot published by a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub index: usize,
    pub region: RegionCode,
    pub addr: SocketAddr,
    /// Latest generation number; 0 before the first launch.
    pub generation: u64,
    pub state: GenerationState,
}

/// Supervisor settings shared by the whole pool.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub refresh_period: Duration,
    /// Relaunch immediately when a generation exits on its own instead of
    /// waiting for the next tick.
    pub relaunch_on_exit: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            refresh_period: DEFAULT_REFRESH_PERIOD,
            relaunch_on_exit: false,
        }
    }
}

/// Supervisor for one region.
pub struct Supervisor<B: Backend> {
    index: usize,
    region: RegionCode,
    addr: SocketAddr,
    schedule: RefreshSchedule,
    relaunch_on_exit: bool,
    backend: Arc<B>,
    current: Option<InstanceHandle>,
    generation: u64,
    status: watch::Sender<SupervisorStatus>,
}

impl<B: Backend> Supervisor<B> {
    /// Create the supervisor for `entry` in a pool of `pool_size`.
    pub fn new(entry: PoolEntry, pool_size: usize, config: &SupervisorConfig, backend: Arc<B>) -> Self {
        let (status, _) = watch::channel(SupervisorStatus {
            index: entry.index,
            region: entry.region,
            addr: entry.addr,
            generation: 0,
            state: GenerationState::Idle,
        });

        Self {
            index: entry.index,
            region: entry.region,
            addr: entry.addr,
            schedule: RefreshSchedule::for_index(entry.index, pool_size, config.refresh_period),
            relaunch_on_exit: config.relaunch_on_exit,
            backend,
            current: None,
            generation: 0,
            status,
        }
    }

    pub fn schedule(&self) -> RefreshSchedule {
        self.schedule
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Run until `shutdown` is signaled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            region = %self.region,
            label = self.region.label(),
            addr = %self.addr,
            stagger_ms = self.schedule.stagger.as_millis() as u64,
            period_secs = self.schedule.period.as_secs(),
            "Supervisor started"
        );

        if sleep_or_shutdown(self.schedule.stagger, &mut shutdown).await {
            let launched_at = Instant::now();
            if self.launch(&mut shutdown).await {
                self.supervise(launched_at, &mut shutdown).await;
            }
        }

        self.release_current().await;
        self.publish(GenerationState::Stopped);
        info!(
            region = %self.region,
            generations = self.generation,
            "Supervisor stopped"
        );
    }

    /// Refresh on every tick until shutdown.
    async fn supervise(&mut self, launched_at: Instant, shutdown: &mut watch::Receiver<bool>) {
        let period = self.schedule.period;
        let mut ticker = interval_at(launched_at + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => break,
                _ = ticker.tick() => {
                    info!(
                        region = %self.region,
                        addr = %self.addr,
                        generation = self.generation,
                        "Refreshing backend"
                    );
                    self.release_current().await;
                    if !self.launch(shutdown).await {
                        break;
                    }
                }
                result = exited(&mut self.current) => {
                    self.current = None;
                    self.on_unexpected_exit(result);
                    if self.relaunch_on_exit && !self.relaunch(shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    /// Start the next generation.
    ///
    /// Returns `false` if shutdown interrupted the start.
    async fn launch(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.generation += 1;
        let spec = InstanceSpec {
            region: self.region,
            addr: self.addr,
            generation: self.generation,
        };
        self.publish(GenerationState::Starting);
        info!(
            region = %self.region,
            label = self.region.label(),
            addr = %self.addr,
            generation = self.generation,
            backend = self.backend.name(),
            "Launching backend"
        );

        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => {
                debug!(region = %self.region, generation = self.generation, "Launch cancelled");
                false
            }
            result = self.backend.start(&spec) => {
                match result {
                    Ok(handle) => {
                        self.current = Some(handle);
                        self.publish(GenerationState::Running);
                        info!(
                            region = %self.region,
                            addr = %self.addr,
                            generation = self.generation,
                            "Backend running"
                        );
                    }
                    Err(e) => {
                        self.publish(GenerationState::Failed);
                        error!(
                            region = %self.region,
                            addr = %self.addr,
                            generation = self.generation,
                            error = %e,
                            "Backend failed to start"
                        );
                    }
                }
                true
            }
        }
    }

    /// Launch again after an unexpected exit, once `RELAUNCH_BACKOFF` has passed.
    async fn relaunch(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if !sleep_or_shutdown(RELAUNCH_BACKOFF, shutdown).await {
            return false;
        }
        self.launch(shutdown).await
    }

    /// Stop the current generation and wait for it to release the address.
    async fn release_current(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };

        self.publish(GenerationState::Draining);
        debug!(
            region = %self.region,
            generation = self.generation,
            "Stopping backend generation"
        );
        if let Err(e) = current.stop().await {
            warn!(
                region = %self.region,
                generation = self.generation,
                error = %e,
                "Backend generation stopped with error"
            );
        }
        self.publish(GenerationState::Released);
    }

    fn on_unexpected_exit(&mut self, result: Result<(), BackendError>) {
        self.publish(GenerationState::Failed);
        match result {
            Ok(()) => warn!(
                region = %self.region,
                generation = self.generation,
                "Backend exited unexpectedly"
            ),
            Err(e) => warn!(
                region = %self.region,
                generation = self.generation,
                error = %e,
                "Backend exited unexpectedly"
            ),
        }
    }

    fn publish(&self, state: GenerationState) {
        self.status.send_replace(SupervisorStatus {
            index: self.index,
            region: self.region,
            addr: self.addr,
            generation: self.generation,
            state,
        });
    }
}

/// Resolve when the current generation exits; pend while there is none.
async fn exited(current: &mut Option<InstanceHandle>) -> Result<(), BackendError> {
    match current {
        Some(handle) => handle.exited().await,
        None => std::future::pending().await,
    }
}
