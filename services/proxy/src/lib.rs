//! shuffle-proxy
//!
//! Load-balances inbound TCP connections across a pool of per-region tunnel
//! backends.
//!
//! ## Architecture
//!
//! ```text
//!                          Manager
//!             ┌───────────────┴────────────────┐
//!      Supervisor(AT) ... Supervisor(US)     Listener
//!             │                                 │
//!      InstanceHandle (gen k)            Router (round robin)
//!             │                                 │
//!      127.0.0.1:base+i  <──── relay ──── client connection
//! ```
//!
//! - `backend`: the start/stop contract for external tunnel clients, with a
//!   process-backed implementation and an in-process mock
//! - `supervisor`: staggered launch and periodic refresh of one region
//! - `router`: round-robin selection and byte-transparent relay
//! - `manager`: owns the pool, the public listener and the shutdown scope

pub mod backend;
pub mod config;
pub mod manager;
pub mod router;
pub mod schedule;
pub mod shutdown;
pub mod supervisor;

pub use backend::{
    Backend, BackendError, CommandBackend, CommandBackendConfig, InstanceHandle, InstanceSpec,
    MockBackend,
};
pub use manager::{Manager, ManagerConfig, ManagerError};
pub use router::{RelayStats, RouteOutcome, Router, Selection};
pub use schedule::{stagger_delay, RefreshSchedule};
pub use supervisor::{GenerationState, Supervisor, SupervisorConfig, SupervisorStatus};
