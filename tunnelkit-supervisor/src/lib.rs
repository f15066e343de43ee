//! Tunnelkit Supervisor - lifecycle management for a locally-run tunnel agent
//!
//! The tunnel agent is an external program (by default the TestingBot tunnel, a Java
//! archive). This crate keeps a valid copy of it cached, launches it with arguments
//! translated from a [`LaunchConfig`], waits until the agent reports readiness through
//! a marker file, watches its diagnostic output for fatal conditions and shuts it
//! down on request.
//!
//! ```rust,no_run
//! use tunnelkit_supervisor::{LaunchConfig, SupervisorConfig, TunnelSupervisor};
//!
//! # async fn run() -> tunnelkit_supervisor::Result<()> {
//! let supervisor = TunnelSupervisor::new(SupervisorConfig::load()?)?;
//! let tunnel = supervisor
//!     .launch(LaunchConfig::new().with_credentials("key", "secret"))
//!     .await?;
//! println!("tunnel running as pid {}", tunnel.pid());
//! supervisor.terminate(&tunnel).await?;
//! # Ok(())
//! # }
//! ```

mod args;
mod artifact;
mod callback;
mod classifier;
mod config;
mod download;
mod error;
mod readiness;
mod runtime;
mod supervisor;

pub use args::{
    API_KEY, API_SECRET, LaunchConfig, TUNNEL_VERSION, VERBOSE, build_arguments, flag_name,
};
pub use artifact::{ArtifactCache, ArtifactDescriptor};
pub use classifier::{
    AgentFault, Classification, INVALID_CREDENTIALS_MESSAGE, classify, fault_of,
};
pub use config::{ArtifactConfig, ReadinessConfig, RuntimeConfig, SupervisorConfig};
pub use download::{FetchError, Fetcher, HttpFetcher};
pub use error::{Result, SupervisorError};
pub use readiness::{ReadinessMonitor, ReadinessOutcome};
pub use runtime::{RuntimeInfo, check_runtime, parse_version, validate_runtime};
pub use supervisor::{TunnelExit, TunnelHandle, TunnelSupervisor};

use serde::{Deserialize, Serialize};

/// Supervisor lifecycle state
///
/// `Idle → Downloading → Verifying → Launching → AwaitingReady → Running →
/// Terminating → Idle`; failures return to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Nothing tracked, ready to launch
    #[default]
    Idle,
    /// Validating or fetching the artifact
    Downloading,
    /// Checking the artifact and the runtime
    Verifying,
    /// Spawning the agent
    Launching,
    /// Agent spawned, waiting for the readiness marker
    AwaitingReady,
    /// Agent is ready
    Running,
    /// Shutdown requested, waiting for exit
    Terminating,
}

impl SupervisorState {
    /// Whether a tunnel process is tracked in this state
    pub fn has_process(self) -> bool {
        matches!(
            self,
            SupervisorState::Launching
                | SupervisorState::AwaitingReady
                | SupervisorState::Running
                | SupervisorState::Terminating
        )
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Idle => write!(f, "idle"),
            SupervisorState::Downloading => write!(f, "downloading"),
            SupervisorState::Verifying => write!(f, "verifying"),
            SupervisorState::Launching => write!(f, "launching"),
            SupervisorState::AwaitingReady => write!(f, "awaiting_ready"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Terminating => write!(f, "terminating"),
        }
    }
}
