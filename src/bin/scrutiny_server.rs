//! Scrutiny server daemon: loads the TOML configuration, opens the
//! configured link and runs the core event loop until interrupted.

use log::{LevelFilter, error, info, warn};

use scrutiny::api::ApiEvent;
use scrutiny::config;
use scrutiny::server::ScrutinyServer;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} /path/to/config/file", args[0]);
        std::process::exit(1);
    }
    Args {
        config_path: args[1].clone(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = parse_args();
    let config = match config::parse_config(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let (server, _api, mut events) = ScrutinyServer::new(config);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ApiEvent::DeviceStateChanged { phase, .. } => {
                    info!("device state: {phase:?}")
                }
                ApiEvent::SessionLost { reason } => warn!("session lost: {reason:?}"),
                ApiEvent::LinkError { fatal } => warn!("link error (fatal: {fatal})"),
                ApiEvent::ValueUpdate { .. } => {}
            }
        }
    });
    server.run().await;
}
