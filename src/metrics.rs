use chrono::{DateTime, Local};
use std::fmt;

pub const UNDEFINED: &str = "Undefined";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    Production,
    ConsumptionTotal,
    ConsumptionNet,
    Storage,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Production => "production",
            Stream::ConsumptionTotal => "total consumption",
            Stream::ConsumptionNet => "net consumption",
            Stream::Storage => "encharge storage",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Power,
    PowerMax,
    PowerMaxDetected,
    EnergyToday,
    EnergyLastSevenDays,
    EnergyLifetime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricFormat {
    Float,
    Bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    Float(f64),
    Bool(bool),
}

/// Characteristic definition handed to the accessory bridge.
#[derive(Debug)]
pub struct MetricDescriptor {
    pub kind: MetricKind,
    pub name: &'static str,
    pub uuid: &'static str,
    pub format: MetricFormat,
    pub unit: Option<&'static str>,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

pub const POWER_METER_SERVICE_UUID: &str = "00000001-000A-1000-8000-0026BB765291";

#[rustfmt::skip]
pub static METRIC_SCHEMA: [MetricDescriptor; 6] = [
    MetricDescriptor { kind: MetricKind::Power, name: "Power", uuid: "00000001-000B-1000-8000-0026BB765291", format: MetricFormat::Float, unit: Some("kW"), min: -100.0, max: 100.0, step: 0.001 },
    MetricDescriptor { kind: MetricKind::PowerMax, name: "Power Max", uuid: "00000002-000B-1000-8000-0026BB765291", format: MetricFormat::Float, unit: Some("kW"), min: -100.0, max: 100.0, step: 0.001 },
    MetricDescriptor { kind: MetricKind::EnergyToday, name: "Energy Today", uuid: "00000003-000B-1000-8000-0026BB765291", format: MetricFormat::Float, unit: Some("kWh"), min: 0.0, max: 1_000_000.0, step: 0.001 },
    MetricDescriptor { kind: MetricKind::EnergyLastSevenDays, name: "Energy Last 7 Days", uuid: "00000004-000B-1000-8000-0026BB765291", format: MetricFormat::Float, unit: Some("kWh"), min: 0.0, max: 1_000_000.0, step: 0.001 },
    MetricDescriptor { kind: MetricKind::EnergyLifetime, name: "Energy Lifetime", uuid: "00000005-000B-1000-8000-0026BB765291", format: MetricFormat::Float, unit: Some("kWh"), min: 0.0, max: 1_000_000.0, step: 0.001 },
    MetricDescriptor { kind: MetricKind::PowerMaxDetected, name: "Power Max Detected", uuid: "00000006-000B-1000-8000-0026BB765291", format: MetricFormat::Bool, unit: None, min: 0.0, max: 1.0, step: 1.0 },
];

impl MetricKind {
    pub fn descriptor(self) -> &'static MetricDescriptor {
        // every kind has exactly one schema row
        METRIC_SCHEMA
            .iter()
            .find(|d| d.kind == self)
            .unwrap_or(&METRIC_SCHEMA[0])
    }
}

/// A power meter service exposed for one stream.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricService {
    pub stream: Stream,
    pub uuid: &'static str,
    pub display_name: &'static str,
    pub subtype: &'static str,
    pub has_max: bool,
    pub has_energy: bool,
}

impl MetricService {
    pub fn for_stream(stream: Stream) -> Self {
        let (display_name, subtype) = match stream {
            Stream::Production => ("Production", "envoyServiceProduction"),
            Stream::ConsumptionTotal => ("Consumption Total", "envoyServiceConsumptionTotal"),
            Stream::ConsumptionNet => ("Consumption Net", "envoyServiceConsumptionNet"),
            Stream::Storage => ("Encharge storage", "envoyServiceEnchargeStorage"),
        };
        let metered = stream != Stream::Storage;
        Self {
            stream,
            uuid: POWER_METER_SERVICE_UUID,
            display_name,
            subtype,
            has_max: metered,
            has_energy: metered,
        }
    }

    pub fn kinds(&self) -> Vec<MetricKind> {
        let mut kinds = vec![MetricKind::Power];
        if self.has_max {
            kinds.push(MetricKind::PowerMax);
            kinds.push(MetricKind::PowerMaxDetected);
        }
        kinds.push(MetricKind::EnergyToday);
        if self.has_energy {
            kinds.push(MetricKind::EnergyLastSevenDays);
            kinds.push(MetricKind::EnergyLifetime);
        }
        kinds
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PowerStream {
    pub power_now_kw: f64,
    pub power_max_kw: f64,
    pub power_max_detected: bool,
    pub energy_today_kwh: f64,
    pub energy_last_seven_days_kwh: f64,
    pub energy_lifetime_kwh: f64,
}

impl PowerStream {
    pub fn value(&self, kind: MetricKind) -> MetricValue {
        match kind {
            MetricKind::Power => MetricValue::Float(self.power_now_kw),
            MetricKind::PowerMax => MetricValue::Float(self.power_max_kw),
            MetricKind::PowerMaxDetected => MetricValue::Bool(self.power_max_detected),
            MetricKind::EnergyToday => MetricValue::Float(self.energy_today_kwh),
            MetricKind::EnergyLastSevenDays => MetricValue::Float(self.energy_last_seven_days_kwh),
            MetricKind::EnergyLifetime => MetricValue::Float(self.energy_lifetime_kwh),
        }
    }
}

impl fmt::Display for PowerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "power: {:.3} kW (max {:.3} kW{}), today: {:.3} kWh, last 7 days: {:.3} kWh, lifetime: {:.3} kWh",
            self.power_now_kw,
            self.power_max_kw,
            if self.power_max_detected { ", detected" } else { "" },
            self.energy_today_kwh,
            self.energy_last_seven_days_kwh,
            self.energy_lifetime_kwh,
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageStream {
    pub power_now_kw: f64,
    pub energy_today_kwh: f64,
}

impl StorageStream {
    pub fn value(&self, kind: MetricKind) -> MetricValue {
        match kind {
            MetricKind::Power => MetricValue::Float(self.power_now_kw),
            MetricKind::EnergyToday => MetricValue::Float(self.energy_today_kwh),
            MetricKind::PowerMaxDetected => MetricValue::Bool(false),
            MetricKind::PowerMax | MetricKind::EnergyLastSevenDays | MetricKind::EnergyLifetime => {
                MetricValue::Float(0.0)
            }
        }
    }
}

impl fmt::Display for StorageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "power: {:.3} kW, energy: {:.3} kWh",
            self.power_now_kw, self.energy_today_kwh
        )
    }
}

/// Status of a single Encharge or Q-Relay unit as reported by the inventory.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitStatus {
    pub producing: String,
    pub communicating: String,
    pub provisioned: String,
    pub operating: String,
    pub device_status: String,
    pub relay: String,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            producing: UNDEFINED.into(),
            communicating: UNDEFINED.into(),
            provisioned: UNDEFINED.into(),
            operating: UNDEFINED.into(),
            device_status: UNDEFINED.into(),
            relay: UNDEFINED.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeterStatus {
    pub state: bool,
    pub measurement_type: String,
    pub phase_mode: String,
    pub phase_count: u64,
    pub metering_status: String,
    pub status_flags: String,
}

impl Default for MeterStatus {
    fn default() -> Self {
        Self {
            state: false,
            measurement_type: UNDEFINED.into(),
            phase_mode: UNDEFINED.into(),
            phase_count: 0,
            metering_status: UNDEFINED.into(),
            status_flags: UNDEFINED.into(),
        }
    }
}

/// Identity and inventory discovered by the info cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    pub serial_number: Option<String>,
    pub firmware_revision: Option<String>,
    /// inventory counts, `None` until the first successful info cycle
    pub inverters: Option<usize>,
    pub encharges: Option<usize>,
    pub qrelays: Option<usize>,
    pub meters: Option<usize>,
    pub encharge: UnitStatus,
    pub qrelay: UnitStatus,
    pub production_meter: MeterStatus,
    pub consumption_meter: MeterStatus,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricSnapshot {
    pub production: PowerStream,
    pub consumption_total: PowerStream,
    pub consumption_net: PowerStream,
    pub storage: StorageStream,
    pub info: DeviceInfo,
    pub reachable: bool,
    pub last_update: Option<DateTime<Local>>,
}

impl MetricSnapshot {
    pub fn value(&self, stream: Stream, kind: MetricKind) -> MetricValue {
        match stream {
            Stream::Production => self.production.value(kind),
            Stream::ConsumptionTotal => self.consumption_total.value(kind),
            Stream::ConsumptionNet => self.consumption_net.value(kind),
            Stream::Storage => self.storage.value(kind),
        }
    }
}
