//! Completion-callback adapters over the async supervisor API
//!
//! Each adapter spawns the corresponding async operation on the current tokio
//! runtime and hands its result to the callback. They must be called from within
//! a runtime.

use crate::supervisor::{TunnelExit, TunnelHandle, TunnelSupervisor};
use crate::{LaunchConfig, Result};
use tokio::task::JoinHandle;

impl TunnelSupervisor {
    /// Callback flavour of [`TunnelSupervisor::launch`]
    pub fn launch_with<F>(&self, options: LaunchConfig, done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<TunnelHandle>) + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move { done(supervisor.launch(options).await) })
    }

    /// Callback flavour of [`TunnelSupervisor::terminate`]; `done` runs after the
    /// process has exited.
    pub fn terminate_with<F>(&self, handle: TunnelHandle, done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<TunnelExit>) + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move { done(supervisor.terminate(&handle).await) })
    }

    /// Callback flavour of [`TunnelSupervisor::kill`]
    pub fn kill_with<F>(&self, done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move { done(supervisor.kill().await) })
    }
}

#[cfg(test)]
mod tests {
    use crate::{SupervisorConfig, SupervisorError, TunnelSupervisor};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn kill_with_reports_no_active_tunnel() {
        let supervisor = TunnelSupervisor::new(SupervisorConfig::default()).unwrap();
        let (tx, rx) = oneshot::channel();

        supervisor.kill_with(move |result| {
            let _ = tx.send(result);
        });

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::NoActiveTunnel)));
        assert_eq!(result.unwrap_err().to_string(), "no active tunnel");
    }
}
