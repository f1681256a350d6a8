use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use blob_store::BlobStorage;
use clap::{Parser, Subcommand};

use crate::{config::Config, ffmpeg::Codec, items::ItemStore};

mod container;
mod ingest;
mod machine;
mod run;

pub use container::ContainerArgs;
pub use ingest::IngestArgs;
pub use machine::MachineArgs;
pub use run::RunArgs;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        value_name = "config file",
        help = "Path to config file"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve container allocation for this machine.
    Machine(MachineArgs),
    /// Run one worker container. Started by the machine server.
    Container(ContainerArgs),
    /// Store a video or data file as an item of a series.
    Ingest(IngestArgs),
    /// Run a query over sampled slices and write the outputs.
    Run(RunArgs),
}

impl Cli {
    pub fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::from_path(&path.to_string_lossy()),
            None => Ok(Config::default()),
        }
    }
}

impl Commands {
    pub fn service_name(&self) -> &'static str {
        match self {
            Commands::Machine(_) => "vaas-machine",
            Commands::Container(_) => "vaas-container",
            Commands::Ingest(_) => "vaas-ingest",
            Commands::Run(_) => "vaas-run",
        }
    }

    pub async fn execute(self, config: Config, config_path: Option<PathBuf>) -> Result<()> {
        match self {
            Commands::Machine(args) => machine::execute(args, config, config_path).await,
            Commands::Container(args) => container::execute(args, config).await,
            Commands::Ingest(args) => ingest::execute(args, config).await,
            Commands::Run(args) => run::execute(args, config).await,
        }
    }
}

/// The item store every subcommand shares through the configured blob
/// storage.
pub(crate) fn item_store(config: &Config) -> Result<Arc<ItemStore>> {
    let blobs = BlobStorage::new(config.blob_storage.clone())?;
    Ok(Arc::new(ItemStore::new(blobs, Codec::new(&config.ffmpeg))))
}
