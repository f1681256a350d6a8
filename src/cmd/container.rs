use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Args;

use super::item_store;
use crate::{
    config::Config,
    container::{self, ContainerState},
    executors::ExecutorRegistry,
};

#[derive(Args, Debug)]
pub struct ContainerArgs {
    #[arg(long)]
    pub listen_addr: SocketAddr,
}

pub async fn execute(args: ContainerArgs, config: Config) -> Result<()> {
    let state = Arc::new(ContainerState::new(
        ExecutorRegistry::builtin(),
        item_store(&config)?,
    ));
    container::run(args.listen_addr, state).await
}
