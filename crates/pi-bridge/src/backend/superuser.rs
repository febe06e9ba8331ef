use std::{io, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{Backend, Bound};
use crate::{
    descriptor::ServiceDescriptor,
    error::BridgeError,
    remote::{GrpcRemote, RemoteService},
    state::ProviderChoice,
};

#[derive(Clone, Debug)]
pub struct SuperuserConfig {
    pub su_path: PathBuf,
    pub daemon_path: PathBuf,
    pub addr: String,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SuperuserConfig {
    fn default() -> Self {
        Self {
            su_path: PathBuf::from("su"),
            daemon_path: PathBuf::from("pi-daemon"),
            addr: pi_util::daemon_addr(),
            connect_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// A launched `su` that is killed when dropped, unless it was handed over.
struct Launch {
    child: Option<Child>,
}

impl Launch {
    fn child(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn release(&mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for Launch {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            debug!("abandoning su launch");
            if let Err(e) = child.start_kill() {
                debug!("failed to kill su: {e}");
            }
        }
    }
}

/// Starts (or reuses) the privileged daemon through `su`.
pub struct SuperuserBackend {
    config: SuperuserConfig,
    child: Mutex<Option<Child>>,
}

impl SuperuserBackend {
    pub fn new(config: SuperuserConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
        }
    }

    async fn reach_daemon(&self) -> Option<Arc<dyn RemoteService>> {
        let remote = GrpcRemote::connect(&self.config.addr, self.config.poll_interval)
            .await
            .ok()?;
        match remote.identity().await {
            Ok(_) => Some(remote.into_shared()),
            Err(err) => {
                debug!("daemon at {} not reachable: {err}", self.config.addr);
                None
            }
        }
    }

    fn spawn_daemon(&self) -> Result<Child, BridgeError> {
        let script = format!(
            "{} --addr {}",
            self.config.daemon_path.display(),
            self.config.addr
        );
        Command::new(&self.config.su_path)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    BridgeError::ConnectionFailure(format!(
                        "su not found at {}",
                        self.config.su_path.display()
                    ))
                } else {
                    BridgeError::ConnectionFailure(format!("failed to launch su: {e}"))
                }
            })
    }
}

#[tonic::async_trait]
impl Backend for SuperuserBackend {
    fn choice(&self) -> ProviderChoice {
        ProviderChoice::Superuser
    }

    async fn bind(&self, _descriptor: &ServiceDescriptor) -> Result<Bound, BridgeError> {
        if let Some(remote) = self.reach_daemon().await {
            info!("reusing running daemon at {}", self.config.addr);
            return Ok(Bound::Service(remote));
        }

        // Dropping `launch` (deadline, denial, or a cancelled bind) kills su.
        let mut launch = Launch {
            child: Some(self.spawn_daemon()?),
        };
        info!("requested superuser daemon at {}", self.config.addr);
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            if let Some(child) = launch.child() {
                match child.try_wait() {
                    Ok(Some(status)) if !status.success() => {
                        launch.release();
                        return Err(BridgeError::ConnectionFailure(format!(
                            "superuser request denied (su exited with {})",
                            status.code().unwrap_or(-1)
                        )));
                    }
                    Ok(Some(_)) => {
                        launch.release();
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return Err(BridgeError::ConnectionFailure(format!(
                            "failed to poll su: {e}"
                        )))
                    }
                }
            }

            if let Some(remote) = self.reach_daemon().await {
                let mut slot = self.child.lock().await;
                if let Some(child) = launch.release() {
                    *slot = Some(child);
                }
                return Ok(Bound::Service(remote));
            }

            if Instant::now() >= deadline {
                return Err(BridgeError::ConnectionFailure(format!(
                    "daemon did not answer at {} within {:?}",
                    self.config.addr, self.config.connect_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn unbind(
        &self,
        remote: Option<&Arc<dyn RemoteService>>,
        _descriptor: &ServiceDescriptor,
        remove: bool,
    ) -> Result<(), BridgeError> {
        if !remove {
            return Ok(());
        }
        if let Some(remote) = remote {
            // The daemon drops the connection while answering.
            if let Err(err) = remote.shutdown().await {
                debug!("daemon shutdown: {err}");
            }
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to stop su process: {e}");
            }
        }
        Ok(())
    }
}
