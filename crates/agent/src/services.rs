//! Control of the local orchestration service.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Runs configured argv vectors, e.g. `["systemctl", "start", "homecloud"]`.
pub struct CommandServiceControl {
    start: Vec<String>,
    stop: Vec<String>,
}

impl CommandServiceControl {
    pub fn new(start: Vec<String>, stop: Vec<String>) -> Self {
        Self { start, stop }
    }
}

async fn run(argv: &[String]) -> anyhow::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        anyhow::bail!("empty command");
    };
    let output = tokio::process::Command::new(program).args(args).output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            argv.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[async_trait]
impl ServiceControl for CommandServiceControl {
    async fn start(&self) -> anyhow::Result<()> {
        run(&self.start).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        run(&self.stop).await
    }
}

/// Keep asking for the orchestration service to start until it succeeds.
pub async fn start_until_acknowledged(control: &dyn ServiceControl, retry: Duration) {
    loop {
        match control.start().await {
            Ok(()) => {
                info!("orchestration service started");
                return;
            }
            Err(e) => {
                warn!(error=%e, retry_in=?retry, "orchestration service did not start");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// Stop the orchestration service once; failures are logged only.
pub async fn stop_once(control: &dyn ServiceControl) {
    match control.stop().await {
        Ok(()) => info!("orchestration service stopped"),
        Err(e) => warn!(error=%e, "could not stop orchestration service"),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::CountingControl;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn start_retries_until_success() {
        let control = CountingControl::default();
        control.failures.store(2, Ordering::SeqCst);
        start_until_acknowledged(&control, Duration::from_secs(5)).await;
        assert_eq!(control.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let control = CommandServiceControl::new(Vec::new(), Vec::new());
        assert!(control.start().await.is_err());
        stop_once(&control).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exit_status_is_checked() {
        let control = CommandServiceControl::new(vec!["true".into()], vec!["false".into()]);
        assert!(control.start().await.is_ok());
        assert!(control.stop().await.is_err());
    }
}
