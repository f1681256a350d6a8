use ::tracing::{error, info_span};
use clap::Parser;

mod allocator;
mod buffer;
mod cmd;
mod config;
mod container;
mod exec;
mod executors;
mod ffmpeg;
mod http_objects;
mod items;
mod machine;
mod service;
mod tracing;

use crate::{cmd::Cli, tracing::setup_tracing};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error loading config: {:?}", err);
            std::process::exit(1);
        }
    };

    let service_name = cli.command.service_name();
    let tracing_provider = match setup_tracing(&config, service_name) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval,
        service_name,
        &config.instance_id(),
    ) {
        error!("error setting up metrics: {:?}", err);
    }

    let root_span = info_span!(
        "vaas",
        env = config.env,
        service = service_name,
        "vaas-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    let result = cli.command.execute(config, cli.config).await;
    if let Err(err) = &result {
        error!("{} failed: {:?}", service_name, err);
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("error shutting down tracer provider: {:?}", err);
        }
    }
    if result.is_err() {
        std::process::exit(1);
    }
}
