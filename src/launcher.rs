//! Traefik child-process supervisor
//!
//! Writes the static configuration, spawns the traefik binary with its
//! output piped into our log stream, waits for readiness, and stops the
//! child with a grace period before force-killing it.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::api_client::TraefikApiClient;
use crate::config::TraefikConfig;
use crate::error::{Error, Result};
use crate::file_store::{atomic_write, dump_document, ConfigFormat};

/// Handle to a running traefik child process
pub struct TraefikProcess {
    child: Child,
    pid: u32,
}

/// Render and atomically write the static configuration file; TOML or YAML
/// is chosen by the file extension.
pub async fn write_static_config(path: &Path, doc: &Value) -> Result<()> {
    let format = ConfigFormat::from_path(path)?;
    let content = dump_document(doc, format)?;
    atomic_write(path.to_path_buf(), content).await?;
    info!(path = %path.display(), "wrote traefik static configuration");
    Ok(())
}

impl TraefikProcess {
    /// Spawn traefik pointed at the static config file. Stdout and stderr
    /// are piped into our logs so traefik output is not lost.
    pub fn spawn(config: &TraefikConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.binary);
        cmd.arg(format!("--configfile={}", config.static_config_file));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // backstop against leaking the child if the controller is dropped
        // without a clean stop()
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            Error::StartupFailed(format!("failed to launch {:?}: {err}", config.binary))
        })?;
        let pid = child.id().unwrap_or(0);
        info!(pid, binary = %config.binary, "traefik process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stop the child: SIGTERM, wait up to `grace_period`, then SIGKILL.
    pub async fn stop(mut self, grace_period: Duration) {
        info!(pid = self.pid, "stopping traefik");

        #[cfg(unix)]
        if self.pid != 0 {
            unsafe {
                libc::kill(self.pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, ?status, "traefik exited");
            }
            Ok(Err(err)) => {
                warn!(pid = self.pid, error = %err, "error waiting for traefik to exit");
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_secs = grace_period.as_secs(),
                    "grace period exceeded, killing traefik"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

fn forward_output<R>(stream: R, source: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(source, line = %line, "traefik");
        }
    });
}

/// Write the static config, spawn traefik, and wait for it to answer its
/// readiness probe. On timeout the child is killed and a startup error is
/// returned.
pub async fn launch(
    config: &TraefikConfig,
    static_doc: &Value,
    api: &TraefikApiClient,
) -> Result<TraefikProcess> {
    write_static_config(Path::new(&config.static_config_file), static_doc).await?;
    let process = TraefikProcess::spawn(config)?;
    match api.wait_for_ready(config.startup_timeout()).await {
        Ok(()) => Ok(process),
        Err(err) => {
            warn!("traefik did not become ready, killing it");
            process.stop(Duration::from_secs(1)).await;
            Err(err)
        }
    }
}
