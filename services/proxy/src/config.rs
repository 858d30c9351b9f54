//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use shuffle_regions::{all_regions, RegionCode, RegionError, RegionPool, DEFAULT_BASE_PORT};

use crate::backend::CommandBackendConfig;
use crate::manager::{ManagerConfig, DEFAULT_BIND_ADDR};

/// Which backend implementation runs each region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// External tunnel client process per generation.
    Command,
    /// In-process echo server (development only).
    Mock,
}

/// shuffle-proxy - round-robin SOCKS load balancer over per-region tunnels.
#[derive(Debug, Parser)]
#[command(name = "shuffle-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Public bind address.
    #[arg(short, long, env = "SHUFFLE_BIND", default_value = DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// First local port of the backend pool.
    #[arg(long, env = "SHUFFLE_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Comma-separated region codes for the pool (default: every known region).
    #[arg(long, env = "SHUFFLE_REGIONS", value_delimiter = ',')]
    pub regions: Vec<RegionCode>,

    /// Use only the first N regions of the pool.
    #[arg(long, env = "SHUFFLE_POOL_SIZE")]
    pub pool_size: Option<usize>,

    /// Run a single backend for this region directly on the bind address.
    #[arg(short = 'c', long, env = "SHUFFLE_REGION")]
    pub region: Option<RegionCode>,

    /// Seconds between backend refreshes.
    #[arg(long, env = "SHUFFLE_REFRESH_SECS", default_value_t = 900)]
    pub refresh_secs: u64,

    /// Milliseconds to wait after launching backends before listening.
    #[arg(long, env = "SHUFFLE_WARMUP_MS", default_value_t = 2000)]
    pub warmup_ms: u64,

    /// Seconds to wait for backends and relays at shutdown.
    #[arg(long, env = "SHUFFLE_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Relaunch a backend immediately when it exits on its own.
    #[arg(long, env = "SHUFFLE_RELAUNCH_ON_EXIT")]
    pub relaunch_on_exit: bool,

    /// Backend implementation.
    #[arg(long, value_enum, env = "SHUFFLE_BACKEND", default_value_t = BackendKind::Command)]
    pub backend: BackendKind,

    /// Tunnel client executable (command backend).
    #[arg(long, env = "SHUFFLE_BACKEND_PROGRAM")]
    pub backend_program: Option<PathBuf>,

    /// Argument template for the tunnel client, repeatable.
    ///
    /// Placeholders: {region} {host} {port} {addr} {generation}.
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    pub backend_args: Vec<String>,

    /// Seconds to wait for a backend to accept connections.
    #[arg(long, env = "SHUFFLE_READY_TIMEOUT_SECS", default_value_t = 60)]
    pub ready_timeout_secs: u64,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SHUFFLE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Reject combinations clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_secs == 0 {
            bail!("--refresh-secs must be greater than zero");
        }
        if self.backend == BackendKind::Command && self.backend_program.is_none() {
            bail!("--backend-program is required with the command backend");
        }
        Ok(())
    }

    /// Filter directive used when RUST_LOG is unset.
    pub fn log_filter(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }

    /// Region pool from `--regions`, `--base-port` and `--pool-size`.
    pub fn pool(&self) -> Result<RegionPool, RegionError> {
        let regions = if self.regions.is_empty() {
            all_regions()
        } else {
            self.regions.clone()
        };

        let pool = RegionPool::new(regions, self.base_port)?;
        match self.pool_size {
            Some(size) => pool.truncated(size),
            None => Ok(pool),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            bind_addr: self.bind,
            refresh_period: Duration::from_secs(self.refresh_secs),
            warmup: Duration::from_millis(self.warmup_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            relaunch_on_exit: self.relaunch_on_exit,
        }
    }

    pub fn command_backend_config(&self) -> Result<CommandBackendConfig> {
        let Some(program) = &self.backend_program else {
            bail!("--backend-program is required with the command backend");
        };

        let mut config = CommandBackendConfig::new(program.clone());
        config.args = self.backend_args.clone();
        config.ready_timeout = Duration::from_secs(self.ready_timeout_secs);
        Ok(config)
    }
}
