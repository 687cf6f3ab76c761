use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use strelay::cli::CliArgs;
use strelay::config::{PathConf, ServerConfig};
use strelay::core::{Core, ServerRuntime};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let mut config = ServerConfig {
        rtsp_address: args.rtsp_address,
        read_timeout: Duration::from_secs_f64(args.read_timeout),
        write_timeout: Duration::from_secs_f64(args.write_timeout),
        write_queue_size: args.write_queue_size,
        udp_max_payload_size: args.udp_max_payload_size,
        ..Default::default()
    };

    // without an explicit configuration, accept any path name
    if config.paths.is_empty() {
        config.paths.insert("~.+".to_string(), PathConf::default());
    }

    info!(
        "strelay starting (read timeout {:?}, write timeout {:?}, write queue {})",
        config.read_timeout, config.write_timeout, config.write_queue_size
    );

    let runtime = ServerRuntime::from_config(&config);
    let core = Core::new(config, runtime);

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("unable to listen for the shutdown signal: {err}");
    }

    info!("shutting down");
    core.close().await;
}
