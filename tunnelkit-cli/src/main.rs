//! Tunnelkit CLI - start, inspect and prepare the tunnel agent

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};
use tunnelkit_supervisor::{
    LaunchConfig, SupervisorConfig, SupervisorError, TunnelSupervisor, build_arguments,
    check_runtime,
};

#[derive(Parser)]
#[command(name = "tunnelkit")]
#[command(about = "Run and supervise the tunnel agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file, instead of tunnelkit.toml / TUNNELKIT_CONFIG_PATH
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging and verbose agent output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the tunnel and keep it running until Ctrl-C
    Start(LaunchArgs),
    /// Download (or reuse) the tunnel artifact and print its path
    Fetch {
        /// Tunnel version to fetch
        #[arg(long)]
        tunnel_version: Option<String>,
    },
    /// Print the detected runtime version
    CheckRuntime,
    /// Print the agent command line without launching
    Args(LaunchArgs),
}

#[derive(Args)]
struct LaunchArgs {
    /// API key
    #[arg(long, env = "TESTINGBOT_KEY")]
    key: String,

    /// API secret
    #[arg(long, env = "TESTINGBOT_SECRET", hide_env_values = true)]
    secret: String,

    /// Tunnel version to run
    #[arg(long)]
    tunnel_version: Option<String>,

    /// Agent option with a value, e.g. `tunnelIdentifier=ci-42`
    #[arg(long = "option", value_name = "NAME=VALUE", value_parser = parse_option)]
    options: Vec<(String, Value)>,

    /// Agent switch, e.g. `noBump`
    #[arg(long = "flag", value_name = "NAME")]
    flags: Vec<String>,
}

impl LaunchArgs {
    fn into_launch_config(self, verbose: bool) -> LaunchConfig {
        let mut config = LaunchConfig::new().with_credentials(self.key, self.secret);
        if let Some(version) = self.tunnel_version {
            config = config.with_version(version);
        }
        for (name, value) in self.options {
            config.set(name, value);
        }
        for flag in self.flags {
            config.set(flag, true);
        }
        if verbose {
            config.set(tunnelkit_supervisor::VERBOSE, true);
        }
        config
    }
}

fn parse_option(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    if name.is_empty() {
        return Err(format!("missing option name in `{raw}`"));
    }
    let value = match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    };
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SupervisorConfig::load().context("failed to load configuration")?,
    };

    match cli.command {
        Commands::Start(args) => {
            let supervisor = TunnelSupervisor::new(config)?;
            start(&supervisor, args.into_launch_config(cli.verbose)).await?;
        }
        Commands::Fetch { tunnel_version } => {
            let supervisor = TunnelSupervisor::new(config)?;
            let artifact = supervisor
                .artifacts()
                .ensure(tunnel_version.as_deref())
                .await
                .context("failed to fetch the tunnel")?;
            println!("{}", artifact.cache_path.display());
        }
        Commands::CheckRuntime => {
            let info = check_runtime(&config.runtime).await?;
            match info.version {
                Some(version) => println!("{} {}", config.runtime.name, version),
                None => println!("{} (unknown version)", config.runtime.name),
            }
            if let Some(warning) = info.warning {
                eprintln!("warning: {}", warning);
            }
        }
        Commands::Args(args) => {
            let supervisor = TunnelSupervisor::new(config)?;
            let options = args.into_launch_config(cli.verbose);
            let artifact = supervisor
                .artifacts()
                .descriptor(options.tunnel_version().as_deref())?;
            let runtime = &supervisor.config().runtime;

            let mut line = vec![runtime.program.clone()];
            line.extend(runtime.launch_args.iter().cloned());
            line.extend(build_arguments(
                &options,
                &artifact.cache_path,
                &supervisor.config().readiness,
            ));
            println!("{}", line.join(" "));
        }
    }

    Ok(())
}

async fn start(supervisor: &TunnelSupervisor, options: LaunchConfig) -> Result<()> {
    let handle = match supervisor.launch(options).await {
        Ok(handle) => handle,
        Err(err @ SupervisorError::LaunchTimeout { .. }) => {
            if let Some(stuck) = supervisor.active_handle().await {
                warn!(pid = stuck.pid(), "Killing tunnel that never became ready");
                if let Err(e) = stuck.close().await {
                    warn!(error = %e, "Failed to stop the tunnel");
                }
            }
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    info!(pid = handle.pid(), "Tunnel is ready, press Ctrl-C to stop");
    println!("{}", handle.pid());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Stopping tunnel");
            let exit = supervisor.terminate(&handle).await?;
            info!(code = ?exit.code, signal = ?exit.signal, "Tunnel stopped");
            Ok(())
        }
        closed = handle.closed() => {
            closed.context("tunnel stopped unexpectedly")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_options() {
        assert_eq!(
            parse_option("tunnelIdentifier=ci-42").unwrap(),
            ("tunnelIdentifier".to_string(), Value::from("ci-42"))
        );
        assert_eq!(
            parse_option("debug=false").unwrap(),
            ("debug".to_string(), Value::Bool(false))
        );
        assert_eq!(
            parse_option("extra=a=b").unwrap(),
            ("extra".to_string(), Value::from("a=b"))
        );
        assert!(parse_option("novalue").is_err());
        assert!(parse_option("=x").is_err());
    }

    #[test]
    fn launch_args_become_launch_config() {
        let cli = Cli::parse_from([
            "tunnelkit",
            "--verbose",
            "args",
            "--key",
            "k",
            "--secret",
            "s",
            "--tunnel-version",
            "3.1",
            "--option",
            "tunnelIdentifier=ci",
            "--flag",
            "noBump",
        ]);
        let Commands::Args(args) = cli.command else {
            panic!("expected args command");
        };
        let config = args.into_launch_config(cli.verbose);

        assert_eq!(config.api_key(), Some("k"));
        assert_eq!(config.api_secret(), Some("s"));
        assert_eq!(config.tunnel_version().as_deref(), Some("3.1"));
        assert_eq!(config.get("tunnelIdentifier"), Some(&Value::from("ci")));
        assert_eq!(config.get("noBump"), Some(&Value::Bool(true)));
        assert!(config.verbose());
    }
}
