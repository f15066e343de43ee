//! Configuration types for the tunnel supervisor

use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Where the tunnel artifact comes from and where it is cached
    pub artifact: ArtifactConfig,

    /// Runtime used to execute the artifact
    pub runtime: RuntimeConfig,

    /// Readiness marker handling
    pub readiness: ReadinessConfig,

    /// How long to wait for an interrupted agent before force killing it
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Extra environment variables for the agent process
    pub env: BTreeMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            artifact: ArtifactConfig::default(),
            runtime: RuntimeConfig::default(),
            readiness: ReadinessConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            env: BTreeMap::new(),
        }
    }
}

/// Artifact source and cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Base URL the artifact file names are appended to
    pub base_url: String,

    /// File name without version suffix or extension
    pub file_stem: String,

    /// File extension, without the dot
    pub extension: String,

    /// Directory holding cached artifacts
    pub cache_dir: PathBuf,

    /// Arguments appended to the artifact for the cache self-check
    pub self_check_args: Vec<String>,

    /// Upper bound for the self-check invocation
    #[serde(with = "humantime_serde")]
    pub self_check_timeout: Duration,

    /// Cached files smaller than this are considered truncated
    pub min_size: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            base_url: "https://testingbot.com/tunnel".to_string(),
            file_stem: "testingbot-tunnel".to_string(),
            extension: "jar".to_string(),
            cache_dir: default_cache_dir(),
            self_check_args: vec!["--help".to_string()],
            self_check_timeout: Duration::from_secs(30),
            min_size: 1024,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tunnelkit")
}

/// Runtime (interpreter/VM) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Human readable runtime name used in messages
    pub name: String,

    /// Executable to invoke
    pub program: String,

    /// Arguments placed between the program and the artifact path
    pub launch_args: Vec<String>,

    /// Arguments that make the runtime report its version
    pub version_args: Vec<String>,

    /// Lowest supported major version
    pub min_version: u32,

    /// Upper bound for the version probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "Java".to_string(),
            program: "java".to_string(),
            launch_args: vec!["-jar".to_string()],
            version_args: vec!["-version".to_string()],
            min_version: 11,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Readiness marker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// File the agent creates once it is ready
    pub marker_path: PathBuf,

    /// Agent flag that receives the marker path
    pub flag: String,

    /// Delay between existence checks
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Number of checks before giving up
    pub max_attempts: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            marker_path: std::env::temp_dir().join("testingbot.ready"),
            flag: "-f".to_string(),
            poll_interval: Duration::from_millis(800),
            max_attempts: 150,
        }
    }
}

impl ReadinessConfig {
    /// Total time a readiness wait may take
    pub fn deadline(&self) -> Duration {
        self.poll_interval.saturating_mul(self.max_attempts)
    }
}

impl SupervisorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `tunnelkit.toml` in the working directory
    /// 3. The file named by `TUNNELKIT_CONFIG_PATH`, if set
    /// 4. `TUNNELKIT_` environment variables, nested keys separated by `__`
    ///    (e.g. `TUNNELKIT_READINESS__MAX_ATTEMPTS=20`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(SupervisorConfig::default()))
            .merge(Toml::file("tunnelkit.toml"));

        if let Ok(path) = std::env::var("TUNNELKIT_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: SupervisorConfig = figment
            .merge(Env::prefixed("TUNNELKIT_").ignore(&["config_path"]).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(SupervisorError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: SupervisorConfig =
            Figment::from(Serialized::defaults(SupervisorConfig::default()))
                .merge(Toml::file(path))
                .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a value would make launching impossible.
    pub fn validate(&self) -> Result<()> {
        if self.artifact.base_url.trim().is_empty() {
            return Err(SupervisorError::Config(
                "artifact.base_url must not be empty".to_string(),
            ));
        }
        if self.artifact.file_stem.trim().is_empty() {
            return Err(SupervisorError::Config(
                "artifact.file_stem must not be empty".to_string(),
            ));
        }
        if self.runtime.program.trim().is_empty() {
            return Err(SupervisorError::Config(
                "runtime.program must not be empty".to_string(),
            ));
        }
        if self.readiness.poll_interval.is_zero() {
            return Err(SupervisorError::Config(
                "readiness.poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.readiness.max_attempts == 0 {
            return Err(SupervisorError::Config(
                "readiness.max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
