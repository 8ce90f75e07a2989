use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::driver::{WifiCredentials, WifiMode};
use crate::identity::BUILD_DEVICE_ID;
use crate::transport::Endpoint;

pub const DEFAULT_HUB_HOSTNAME: &str = "localhost";
pub const DEFAULT_NTP_HOSTNAME: &str = "pool.ntp.org";
pub const DEFAULT_MODEL_ID: &str = "dtmi:com:example:Thermostat;1";

const CONFIG_FILE_NAME: &str = "device_config.json";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub device_id: Option<String>,
    pub hub_hostname: String,
    pub provisioning_host: Option<String>,
    pub id_scope: Option<String>,
    pub mqtt_port: u16,
    pub keep_alive_secs: u64,
    pub model_id: String,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub serial_number_path: Option<PathBuf>,
    pub ntp_hostname: String,
    pub cloud_interval_ms: u64,
    pub data_interval_ms: u64,
    pub send_interval_secs: u64,
    pub main_tick_ms: u64,
    pub driver_wait_limit: Option<u32>,
    pub wifi_mode: WifiMode,
    pub wifi: Option<WifiCredentials>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_id: BUILD_DEVICE_ID.map(str::to_string),
            hub_hostname: DEFAULT_HUB_HOSTNAME.to_string(),
            provisioning_host: None,
            id_scope: None,
            mqtt_port: 8883,
            keep_alive_secs: 60,
            model_id: DEFAULT_MODEL_ID.to_string(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            serial_number_path: None,
            ntp_hostname: DEFAULT_NTP_HOSTNAME.to_string(),
            cloud_interval_ms: 500,
            data_interval_ms: 1000,
            send_interval_secs: 1,
            main_tick_ms: 10,
            driver_wait_limit: None,
            wifi_mode: WifiMode::Default,
            wifi: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let wifi_mode = match env::var("WIFI_MODE").ok().as_deref() {
            Some("soft_ap") => WifiMode::SoftAp,
            Some("default") | None => WifiMode::Default,
            Some(other) => anyhow::bail!("unknown WIFI_MODE `{other}`"),
        };
        let wifi = match (env::var("WIFI_SSID"), env::var("WIFI_KEY")) {
            (Ok(ssid), Ok(key)) => Some(WifiCredentials {
                security_type: get_env_var("WIFI_SECURITY_TYPE", 2),
                ssid,
                key,
            }),
            _ => None,
        };

        Ok(Config {
            device_id: env::var("HUB_DEVICE_ID").ok().or(defaults.device_id),
            hub_hostname: env::var("HUB_HOSTNAME").unwrap_or(defaults.hub_hostname),
            provisioning_host: env::var("PROVISIONING_HOST").ok(),
            id_scope: env::var("ID_SCOPE").ok(),
            mqtt_port: get_env_var("MQTT_PORT", defaults.mqtt_port),
            keep_alive_secs: get_env_var("KEEP_ALIVE_SECS", defaults.keep_alive_secs),
            model_id: env::var("MODEL_ID").unwrap_or(defaults.model_id),
            ca_cert: env::var("CA_CERT").ok().map(PathBuf::from),
            client_cert: env::var("CLIENT_CERT").ok().map(PathBuf::from),
            client_key: env::var("CLIENT_KEY").ok().map(PathBuf::from),
            serial_number_path: env::var("SERIAL_NUMBER_PATH").ok().map(PathBuf::from),
            ntp_hostname: env::var("NTP_HOSTNAME").unwrap_or(defaults.ntp_hostname),
            cloud_interval_ms: get_env_var("CLOUD_INTERVAL_MS", defaults.cloud_interval_ms),
            data_interval_ms: get_env_var("DATA_INTERVAL_MS", defaults.data_interval_ms),
            send_interval_secs: get_env_var("SEND_INTERVAL_SECS", defaults.send_interval_secs),
            main_tick_ms: get_env_var("MAIN_TICK_MS", defaults.main_tick_ms),
            driver_wait_limit: env::var("DRIVER_WAIT_LIMIT").ok().and_then(|v| v.parse().ok()),
            wifi_mode,
            wifi,
        })
    }

    fn file_path() -> PathBuf {
        let dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(dir).join(CONFIG_FILE_NAME)
    }

    /// Configuration file if one exists, environment otherwise.
    pub fn load() -> Result<Self> {
        if Self::file_path().exists() {
            Self::load_from_file()
        } else {
            Self::from_env()
        }
    }

    pub fn load_from_file() -> Result<Self> {
        Self::read_from(&Self::file_path())
    }

    /// Persist the current settings, Wi-Fi credentials included.
    pub fn save_to_file(&self) -> Result<()> {
        self.write_to(&Self::file_path())
    }

    fn read_from(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Endpoint for the first cloud session: the provisioning service when
    /// one is configured, the production hub otherwise.
    pub fn initial_endpoint(&self) -> Endpoint {
        match (&self.provisioning_host, &self.id_scope) {
            (Some(host), Some(id_scope)) => Endpoint::Provisioning {
                host: host.clone(),
                id_scope: id_scope.clone(),
            },
            _ => self.hub_endpoint(),
        }
    }

    pub fn hub_endpoint(&self) -> Endpoint {
        Endpoint::Hub {
            host: self.hub_hostname.clone(),
        }
    }

    // timer periods must be non-zero
    pub fn cloud_interval(&self) -> Duration {
        Duration::from_millis(self.cloud_interval_ms.max(1))
    }

    pub fn data_interval(&self) -> Duration {
        Duration::from_millis(self.data_interval_ms.max(1))
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn main_tick(&self) -> Duration {
        Duration::from_millis(self.main_tick_ms.max(1))
    }
}

fn get_env_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
