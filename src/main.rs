use anyhow::Result;
use std::env;
use tokio::time::{self, MissedTickBehavior};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sensor_node::device::{LogIndicator, SimulatedSensor};
use sensor_node::driver::HostDriver;
use sensor_node::identity::FileSecureElement;
use sensor_node::transport::{MqttSettings, MqttTransport};
use sensor_node::{App, Config, Peripherals};

fn initialize_tracing() {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    initialize_tracing();

    let config = Config::load()?;
    tracing::info!(hub = %config.hub_hostname, mode = ?config.wifi_mode, "Device starting");

    let peripherals = Peripherals {
        driver: Box::new(HostDriver::new()),
        transport: Box::new(MqttTransport::new(MqttSettings::from(&config))),
        secure_element: Box::new(FileSecureElement::new(config.serial_number_path.clone())),
        sensor: Box::new(SimulatedSensor::default()),
        indicator: Box::new(LogIndicator::default()),
    };

    let mut tick = time::interval(config.main_tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut app = App::new(config, peripherals);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => app.tasks(),
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
