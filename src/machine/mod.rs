use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use axum_server::Handle;
use data_model::{Container, Environment};
use tokio::{
    net::TcpStream,
    process::{Child, ChildStdin, Command},
    sync::{watch, Mutex},
    time::Instant,
};
use tracing::{error, info, warn};

use crate::{config::ContainerConfig, service::shutdown_signal};

mod routes;

pub use routes::create_routes;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn find_free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// How container processes are started. The container subcommand and its
/// listen address are appended to `args`.
#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<String>,
}

impl Launcher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-runs the current binary, passing on the config file.
    pub fn current_exe(config_path: Option<&Path>) -> Result<Self> {
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        Ok(Self::new(std::env::current_exe()?, args))
    }

    fn command(&self, listen_addr: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(["container", "--listen-addr", listen_addr])
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

struct ContainerProcess {
    child: Child,
    /// Closing stdin asks the container to exit.
    stdin: Option<ChildStdin>,
}

/// Containers running on this machine.
pub struct MachineState {
    launcher: Launcher,
    config: ContainerConfig,
    children: Mutex<HashMap<String, ContainerProcess>>,
}

impl MachineState {
    pub fn new(launcher: Launcher, config: ContainerConfig) -> Self {
        Self {
            launcher,
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a container for `environment` and waits until it accepts
    /// connections.
    pub async fn allocate(&self, environment: Environment) -> Result<Container> {
        let port = find_free_local_port()?;
        let uuid = uuid::Uuid::new_v4().to_string();
        info!(uuid, port, template = environment.template, "starting container");
        let mut child = self
            .launcher
            .command(&format!("0.0.0.0:{port}"))
            .spawn()
            .map_err(|err| anyhow!("failed to spawn container: {}", err))?;
        let stdin = child.stdin.take();

        if let Err(err) = self.wait_ready(&mut child, port).await {
            error!(uuid, "container did not start: {:?}", err);
            if let Err(err) = child.kill().await {
                warn!(uuid, "failed to kill container: {:?}", err);
            }
            return Err(err);
        }

        let container = Container {
            uuid: uuid.clone(),
            environment,
            base_url: format!("http://{}:{}", self.config.advertise_host, port),
            machine_idx: 0,
        };
        self.children
            .lock()
            .await
            .insert(uuid, ContainerProcess { child, stdin });
        Ok(container)
    }

    async fn wait_ready(&self, child: &mut Child, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout();
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(anyhow!("container exited with {} before listening", status));
            }
            if TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "container did not listen on port {} within {:?}",
                    port,
                    self.config.startup_timeout()
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stops container `uuid`. Returns false when no such container runs
    /// here.
    pub async fn deallocate(&self, uuid: &str) -> Result<bool> {
        let Some(process) = self.children.lock().await.remove(uuid) else {
            return Ok(false);
        };
        self.stop(uuid, process).await?;
        Ok(true)
    }

    async fn stop(&self, uuid: &str, mut process: ContainerProcess) -> Result<()> {
        drop(process.stdin.take());
        match tokio::time::timeout(self.config.shutdown_grace(), process.child.wait()).await {
            Ok(status) => {
                info!(uuid, "container exited with {}", status?);
            }
            Err(_) => {
                warn!(uuid, "container ignored stdin close, killing it");
                process.child.kill().await?;
            }
        }
        Ok(())
    }

    pub async fn container_count(&self) -> usize {
        self.children.lock().await.len()
    }

    pub async fn stop_all(&self) {
        let children: Vec<(String, ContainerProcess)> =
            self.children.lock().await.drain().collect();
        for (uuid, process) in children {
            if let Err(err) = self.stop(&uuid, process).await {
                error!(uuid, "failed to stop container: {:?}", err);
            }
        }
    }
}

/// Serves `/allocate` and `/deallocate` until a shutdown signal, then stops
/// every container.
pub async fn run(listen_addr: SocketAddr, state: Arc<MachineState>) -> Result<()> {
    let handle = Handle::new();
    let (shutdown_tx, _) = watch::channel(());
    tokio::spawn(shutdown_signal(handle.clone(), shutdown_tx));

    info!("machine listening on {}", listen_addr);
    let served = axum_server::bind(listen_addr)
        .handle(handle)
        .serve(create_routes(state.clone()).into_make_service())
        .await;
    info!(containers = state.container_count().await, "stopping containers");
    state.stop_all().await;
    served.map_err(|err| anyhow!("machine server failed: {}", err))
}
