pub mod app;
pub mod bringup;
pub mod cloud;
pub mod command;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod identity;
pub mod provisioning;
pub mod scheduler;
pub mod telemetry;
pub mod topics;
pub mod transport;
pub mod twin;
pub mod types;

pub use app::{App, DeviceContext, Peripherals};
pub use config::Config;
