use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use clap::Args;

use crate::{
    config::Config,
    machine::{self, Launcher, MachineState},
};

#[derive(Args, Debug)]
pub struct MachineArgs {
    /// Overrides `listen_addr` from the config.
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,
}

pub async fn execute(args: MachineArgs, config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let listen_addr = match args.listen_addr {
        Some(addr) => addr,
        None => config
            .listen_addr
            .parse()
            .map_err(|err| anyhow!("invalid listen address {}: {}", config.listen_addr, err))?,
    };
    let launcher = Launcher::current_exe(config_path.as_deref())?;
    let state = Arc::new(MachineState::new(launcher, config.container.clone()));
    machine::run(listen_addr, state).await
}
