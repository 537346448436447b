//! Container environment abstraction.
//!
//! The server aggregate drives its workload through the [`Environment`]
//! trait; the Docker implementation in [`docker`] is the only production
//! backend, but tests (and the power-action state machine) only ever see the
//! trait. The environment owns the single source of truth for the process
//! state and publishes `status`, `stats`, console, and image-pull events
//! into the bus handed to it at construction.

pub mod docker;
mod error;
mod state;
mod types;

pub use error::{EnvError, Result};
pub use state::{ProcessState, StateHolder};
pub use types::{
    Allocations, ContainerSpec, LogCallback, Mount, ResourceLimits, Stats, StopConfig, StopType,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roost_events::Bus;

/// Exit information for the last observed container stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitState {
    pub exit_code: i64,
    /// True when the exit was clean: a zero code without the OOM killer
    /// involved.
    pub ok: bool,
    pub oom_killed: bool,
}

/// A server's container runtime, hidden behind a small interface.
///
/// Every async operation is cancel-safe at its suspension points; callers
/// bound them with their own cancellation contexts.
#[async_trait]
pub trait Environment: Send + Sync {
    /// The bus this environment publishes into.
    fn events(&self) -> &Bus;

    /// Whether the underlying container exists.
    async fn exists(&self) -> Result<bool>;

    /// Whether the container is currently running, according to the runtime
    /// rather than the cached state.
    async fn is_running(&self) -> Result<bool>;

    /// Ensures the container exists and matches `spec`, creating it when
    /// absent and recreating it when the image changed. Idempotent.
    async fn create(&self, spec: ContainerSpec) -> Result<()>;

    /// Starts the container, attaching output and stats streams.
    async fn start(&self) -> Result<()>;

    /// Sends the configured stop signal or command. Does not force-kill and
    /// does not wait for the container to exit.
    async fn stop(&self) -> Result<()>;

    /// Waits until the container stops. When the duration elapses first and
    /// `terminate` is set, the container is killed; otherwise a timeout
    /// error is returned.
    async fn wait_for_stop(&self, timeout: Duration, terminate: bool) -> Result<()>;

    /// Kills the container immediately.
    async fn terminate(&self, signal: &str) -> Result<()>;

    /// Removes the container and its resources.
    async fn destroy(&self) -> Result<()>;

    /// Writes a line to the container's stdin. Fails with an invalid-state
    /// error when the container is not attached.
    async fn attach_input(&self, line: &str) -> Result<()>;

    /// Exit code and cleanliness of the last observed stop.
    fn exit_state(&self) -> ExitState;

    /// Cached process state; never blocks.
    fn state(&self) -> ProcessState;

    /// Updates the process state, publishing a `status` event when the value
    /// changed.
    fn set_state(&self, state: ProcessState);

    /// Milliseconds since the container started, zero when offline.
    fn uptime(&self) -> u64;

    /// The most recent resource sample.
    fn resources(&self) -> Stats;

    /// Registers the callback invoked for every console line the container
    /// produces.
    fn set_log_callback(&self, cb: Arc<LogCallback>);
}
