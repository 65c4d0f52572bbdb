//! Runs the free/busy gateway until Ctrl+C is pressed
//!
//! The account is read from the `IFB_BASE_URL`, `IFB_USERNAME` and `IFB_SECRET` environment variables.
//! `IFB_PORT`, `IFB_DATA_DIR` and `IFB_CACHE_HOURS` optionally override the defaults.
//! Set `RUST_LOG` (e.g. `RUST_LOG=ifb_gateway=debug`) to display more info.

use std::path::PathBuf;
use std::str::FromStr;

use ifb_gateway::{Gateway, GatewayConfiguration, GatewaySettings};

fn env_or_default<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Err(_) => default,
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("Ignoring invalid value {:?} for {}", value, name);
                default
            },
        },
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = GatewayConfiguration::new(
        std::env::var("IFB_BASE_URL").unwrap_or_default(),
        std::env::var("IFB_USERNAME").unwrap_or_default(),
        std::env::var("IFB_SECRET").unwrap_or_default(),
    );

    let defaults = GatewaySettings::default();
    let settings = GatewaySettings {
        port: env_or_default("IFB_PORT", defaults.port),
        cache_hours: env_or_default("IFB_CACHE_HOURS", defaults.cache_hours),
        data_dir: std::env::var_os("IFB_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir.clone()),
        ..defaults
    };

    let mut gateway = Gateway::new(config, settings);
    if let Err(err) = gateway.start().await {
        log::error!("Unable to start the gateway: {}", err);
        std::process::exit(1);
    }
    println!("Free/busy URL template: {}", gateway.url_template());

    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Unable to listen for Ctrl+C: {}", err);
    }
    gateway.stop().await;
}
