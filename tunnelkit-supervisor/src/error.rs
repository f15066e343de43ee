//! Error types for supervisor operations

use crate::SupervisorState;
use crate::classifier::AgentFault;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The artifact could not be fetched (transport failure or HTTP error status)
    #[error("Could not download the tunnel from TestingBot - please check your connection. {0}")]
    ArtifactUnavailable(String),

    /// A fetch reported success but nothing is on disk
    #[error("Tunnel artifact is not present in {}", .0.display())]
    ArtifactMissing(PathBuf),

    /// The runtime could not be invoked at all
    #[error("{runtime} might not be installed, necessary to use the tunnel: {reason}")]
    RuntimeMissing { runtime: String, reason: String },

    /// The runtime is older than the supported minimum
    #[error("{runtime} {found} is installed, but {runtime} {required} or higher is required")]
    RuntimeTooOld {
        runtime: String,
        found: u32,
        required: u32,
    },

    /// The runtime answered but its version could not be read.
    ///
    /// Never returned as a failure; only rendered into launch warnings.
    #[error("Could not determine {runtime} version from output: {output}")]
    RuntimeVersionUnknown { runtime: String, output: String },

    #[error("Tunnel did not become ready within {}", display_elapsed(.elapsed))]
    LaunchTimeout { elapsed: Duration },

    /// The agent reported a fatal condition on its diagnostic stream
    #[error("{0}")]
    AgentFatal(AgentFault),

    /// The agent exited before becoming ready and printed nothing recognizable
    #[error("Could not start the tunnel. Exit code {} signal: {}", display_opt(.code), display_opt(.signal))]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The agent exited on its own after it was running
    #[error("Tunnel exited unexpectedly. Exit code {} signal: {}", display_opt(.code), display_opt(.signal))]
    TunnelLost {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("no active tunnel")]
    NoActiveTunnel,

    #[error("A tunnel is already being supervised (state: {0})")]
    Busy(SupervisorState),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_elapsed(elapsed: &Duration) -> String {
    humantime_serde::re::humantime::format_duration(*elapsed).to_string()
}

fn display_opt(value: &Option<i32>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}

impl From<figment::Error> for SupervisorError {
    fn from(err: figment::Error) -> Self {
        SupervisorError::Config(format!("Failed to load configuration: {}", err))
    }
}
