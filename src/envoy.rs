use crate::config::DeviceConfig;
use crate::error::{EnvoyError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

pub const INFO: &str = "/info.xml";
pub const INVENTORY: &str = "/inventory.json";
pub const METERS: &str = "/ivp/meters";
pub const PRODUCTION: &str = "/api/v1/production";
pub const PRODUCTION_CT: &str = "/production.json";

pub const ENVOY_REQUEST_TIMEOUT_SECS: u64 = 10;

/// `/api/v1/production`: inverter-summed production
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyProduction {
    pub watts_now: Option<f64>,
    pub watt_hours_today: Option<f64>,
    pub watt_hours_seven_days: Option<f64>,
    pub watt_hours_lifetime: Option<f64>,
}

/// One entry of the `production`, `consumption` or `storage` arrays of `/production.json`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeterReading {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub w_now: Option<f64>,
    pub wh_today: Option<f64>,
    pub wh_last_seven_days: Option<f64>,
    pub wh_lifetime: Option<f64>,
    pub wh_now: Option<f64>,
}

/// `/production.json`: CT metered production, consumption and storage
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CombinedProduction {
    #[serde(default)]
    pub production: Vec<MeterReading>,
    #[serde(default)]
    pub consumption: Vec<MeterReading>,
    #[serde(default)]
    pub storage: Vec<MeterReading>,
}

/// `/info.xml`: `<envoy_info><device><sn/><software/></device></envoy_info>`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct EnvoyInfo {
    #[serde(default)]
    pub device: Vec<InfoDevice>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct InfoDevice {
    pub sn: Option<String>,
    pub software: Option<String>,
}

/// Everything fetched by one info cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfoPayload {
    pub inventory: Value,
    pub info: EnvoyInfo,
    pub meters: Value,
}

/// Everything fetched by one update cycle. `legacy` is only present when
/// production is read from the legacy API.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdatePayload {
    pub legacy: Option<LegacyProduction>,
    pub combined: CombinedProduction,
}

/// Where a device's telemetry comes from; each fetch is all-or-nothing.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_info(&self) -> Result<InfoPayload>;
    async fn fetch_update(&self) -> Result<UpdatePayload>;
}

#[derive(Clone, Debug)]
pub struct EnvoyClient {
    pub name: String,
    base_url: String,
    legacy_production: bool,
    client: reqwest::Client,
}

impl EnvoyClient {
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        Self::with_base_url(config, config.base_url())
    }

    pub fn with_base_url(config: &DeviceConfig, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ENVOY_REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            name: config.name.clone(),
            base_url: base_url.into(),
            legacy_production: config.legacy_production(),
            client,
        })
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let now = Instant::now();
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.text().await?;
        trace!(
            "{}: GET {} [⏱ {} ms]: {}",
            self.name,
            url,
            now.elapsed().as_millis(),
            body
        );
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.get_text(path).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn inventory(&self) -> Result<Value> {
        self.get_json(INVENTORY).await
    }

    pub async fn meters(&self) -> Result<Value> {
        self.get_json(METERS).await
    }

    pub async fn info(&self) -> Result<EnvoyInfo> {
        let body = self.get_text(INFO).await?;
        quick_xml::de::from_str(&body).map_err(EnvoyError::from)
    }

    pub async fn legacy_production(&self) -> Result<LegacyProduction> {
        self.get_json(PRODUCTION).await
    }

    pub async fn combined_production(&self) -> Result<CombinedProduction> {
        self.get_json(PRODUCTION_CT).await
    }
}

#[async_trait]
impl TelemetrySource for EnvoyClient {
    async fn fetch_info(&self) -> Result<InfoPayload> {
        debug!("{}: requesting config information", self.name);
        let (inventory, info, meters) =
            futures::try_join!(self.inventory(), self.info(), self.meters())?;
        Ok(InfoPayload {
            inventory,
            info,
            meters,
        })
    }

    async fn fetch_update(&self) -> Result<UpdatePayload> {
        // with CT metering the production endpoint is the combined one
        if self.legacy_production {
            let (legacy, combined) =
                futures::try_join!(self.legacy_production(), self.combined_production())?;
            Ok(UpdatePayload {
                legacy: Some(legacy),
                combined,
            })
        } else {
            Ok(UpdatePayload {
                legacy: None,
                combined: self.combined_production().await?,
            })
        }
    }
}
