use crate::error::{EnvoyError, Result};
use ini::{Ini, Properties};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "envoyd.conf";
pub const DEFAULT_STORAGE_PATH: &str = "./envoyd-storage";
pub const DEFAULT_HOST: &str = "envoy.local";
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
const GENERAL_SECTION: &str = "general";

/// Settings of one Envoy gateway, immutable once loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    pub refresh_interval: u64,
    pub encharge_storage: bool,
    pub encharge_storage_offset: f64,
    pub consumption_meters_installed: bool,
    /// 0: production taken from the CT (`/production.json`) endpoint,
    /// otherwise from the legacy `/api/v1/production` endpoint
    pub production_meter: u8,
    pub production_max_detected: f64,
    pub production_lifetime_offset: f64,
    /// number of consumption CTs beyond the first one (0..=2)
    pub consumption_meter: u8,
    pub consumption_total_max_detected: f64,
    pub consumption_total_lifetime_offset: f64,
    pub consumption_net_max_detected: f64,
    pub consumption_net_lifetime_offset: f64,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_revision: String,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL_SECS,
            encharge_storage: false,
            encharge_storage_offset: 0.0,
            consumption_meters_installed: false,
            production_meter: 0,
            production_max_detected: 0.0,
            production_lifetime_offset: 0.0,
            consumption_meter: 0,
            consumption_total_max_detected: 0.0,
            consumption_total_lifetime_offset: 0.0,
            consumption_net_max_detected: 0.0,
            consumption_net_lifetime_offset: 0.0,
            manufacturer: "Enphase".into(),
            model: "Envoy".into(),
            serial_number: "Serial Number".into(),
            firmware_revision: "Firmware Revision".into(),
        }
    }

    fn from_section(name: &str, section: &Properties) -> Result<Self> {
        let defaults = DeviceConfig::new(name, DEFAULT_HOST);
        let key = SectionReader { name, section };

        let config = Self {
            name: name.to_string(),
            host: key.string("host", &defaults.host),
            refresh_interval: key.number("refresh_interval", defaults.refresh_interval)?,
            encharge_storage: key.boolean("encharge_storage", false)?,
            encharge_storage_offset: key.number("encharge_storage_offset", 0.0)?,
            consumption_meters_installed: key.boolean("consumption_meters_installed", false)?,
            production_meter: key.number("production_meter", 0)?,
            production_max_detected: key.number("production_max_detected", 0.0)?,
            production_lifetime_offset: key.number("production_lifetime_offset", 0.0)?,
            consumption_meter: key.number("consumption_meter", 0)?,
            consumption_total_max_detected: key.number("consumption_total_max_detected", 0.0)?,
            consumption_total_lifetime_offset: key
                .number("consumption_total_lifetime_offset", 0.0)?,
            consumption_net_max_detected: key.number("consumption_net_max_detected", 0.0)?,
            consumption_net_lifetime_offset: key.number("consumption_net_lifetime_offset", 0.0)?,
            manufacturer: key.string("manufacturer", &defaults.manufacturer),
            model: key.string("model", &defaults.model),
            serial_number: key.string("serial_number", &defaults.serial_number),
            firmware_revision: key.string("firmware_revision", &defaults.firmware_revision),
        };

        if config.refresh_interval == 0 {
            return Err(EnvoyError::Config(format!(
                "[{}] refresh_interval must be at least 1 second",
                name
            )));
        }
        if config.consumption_meter > 2 {
            return Err(EnvoyError::Config(format!(
                "[{}] consumption_meter must be 0, 1 or 2, got {}",
                name, config.consumption_meter
            )));
        }

        Ok(config)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.host)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn legacy_production(&self) -> bool {
        self.production_meter != 0
    }

    pub fn has_consumption_total(&self) -> bool {
        self.consumption_meters_installed
    }

    pub fn has_consumption_net(&self) -> bool {
        self.consumption_meters_installed && self.consumption_meter >= 1
    }
}

struct SectionReader<'a> {
    name: &'a str,
    section: &'a Properties,
}

impl SectionReader<'_> {
    fn string(&self, key: &str, default: &str) -> String {
        match self.section.get(key) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => default.to_string(),
        }
    }

    fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.section.get(key).map(str::trim) {
            None | Some("") => Ok(default),
            Some(v) => v.parse::<T>().map_err(|_| {
                EnvoyError::Config(format!("[{}] {}: invalid number: {:?}", self.name, key, v))
            }),
        }
    }

    fn boolean(&self, key: &str, default: bool) -> Result<bool> {
        match self.section.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "" => Ok(default),
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(EnvoyError::Config(format!(
                    "[{}] {}: invalid boolean: {:?}",
                    self.name, key, v
                ))),
            },
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub log: Option<String>,
    pub storage_path: PathBuf,
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conf = Ini::load_from_file(path).map_err(|e| {
            EnvoyError::Config(format!("cannot load config file {:?}: {}", path, e))
        })?;
        Config::from_ini(&conf)
    }

    pub fn from_ini(conf: &Ini) -> Result<Self> {
        let general = conf.section(Some(GENERAL_SECTION));
        let log = general.and_then(|s| s.get("log")).map(String::from);
        let storage_path = general
            .and_then(|s| s.get("storage_path"))
            .unwrap_or(DEFAULT_STORAGE_PATH);

        let mut devices = vec![];
        for (section_name, section) in conf.iter() {
            match section_name {
                Some(name) if name != GENERAL_SECTION => {
                    devices.push(DeviceConfig::from_section(name, section)?);
                }
                _ => {}
            }
        }

        if devices.is_empty() {
            return Err(EnvoyError::Config("no devices configured".into()));
        }

        Ok(Self {
            log,
            storage_path: PathBuf::from(storage_path),
            devices,
        })
    }
}
