/*!
Service control: the external collaborator that starts and stops compose
services.

The coordinators only ever talk to the [`ServiceControl`] trait; production
runs use [`ComposeControl`], tests use [`StaticServiceControl`].
*/

use crate::{Result, VaultError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::debug;

/// Start/stop/inspect one named service of the running stack.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self, service: &str) -> Result<()>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn is_running(&self, service: &str) -> Result<bool>;
    /// Recent log output for the service, captured with `--include-logs`.
    async fn logs(&self, service: &str) -> Result<String>;
}

#[async_trait]
impl<T: ServiceControl + ?Sized> ServiceControl for std::sync::Arc<T> {
    async fn start(&self, service: &str) -> Result<()> {
        self.as_ref().start(service).await
    }

    async fn stop(&self, service: &str) -> Result<()> {
        self.as_ref().stop(service).await
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        self.as_ref().is_running(service).await
    }

    async fn logs(&self, service: &str) -> Result<String> {
        self.as_ref().logs(service).await
    }
}

/// `docker compose` backed implementation.
#[derive(Debug, Clone)]
pub struct ComposeControl {
    project_dir: PathBuf,
}

impl ComposeControl {
    pub fn new<P: Into<PathBuf>>(project_dir: P) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    async fn compose(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "running docker compose");
        let output = Command::new("docker")
            .arg("compose")
            .args(args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(VaultError::service(format!(
                "docker compose {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ServiceControl for ComposeControl {
    async fn start(&self, service: &str) -> Result<()> {
        self.compose(&["start", service]).await?;
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        self.compose(&["stop", service]).await?;
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        // `ps -q` prints the container id only while the service is up.
        let stdout = self
            .compose(&["ps", "-q", "--status", "running", service])
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn logs(&self, service: &str) -> Result<String> {
        self.compose(&["logs", "--no-color", "--tail", "1000", service])
            .await
    }
}

/// In-memory service control for tests and dry runs: tracks which services
/// are running and records every start/stop call in order.
#[derive(Debug, Default)]
pub struct StaticServiceControl {
    running: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl StaticServiceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_running<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let control = Self::new();
        {
            let mut running = control.running.lock().unwrap();
            for service in services {
                running.insert(service.into());
            }
        }
        control
    }

    /// Every start/stop call recorded so far, e.g. `"stop mem0-api"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, action: &str, service: &str) {
        self.calls.lock().unwrap().push(format!("{action} {service}"));
    }
}

#[async_trait]
impl ServiceControl for StaticServiceControl {
    async fn start(&self, service: &str) -> Result<()> {
        self.record("start", service);
        self.running.lock().unwrap().insert(service.to_string());
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        self.record("stop", service);
        self.running.lock().unwrap().remove(service);
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(service))
    }

    async fn logs(&self, service: &str) -> Result<String> {
        Ok(format!("log output for {service}\n"))
    }
}
