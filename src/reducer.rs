use crate::config::DeviceConfig;
use crate::envoy::{CombinedProduction, MeterReading, UpdatePayload, PRODUCTION};
use crate::error::{EnvoyError, Result};
use crate::metrics::{MetricSnapshot, PowerStream, StorageStream, Stream};
use crate::watermark::{WatermarkKind, WatermarkStore};
use chrono::Local;

/// W -> kW and Wh -> kWh
pub const UNIT_DIVISOR: f64 = 1000.0;

/// Index of the CT ("eim") entry in the `production` array; index 0 is the
/// inverter-level sum.
pub const PRODUCTION_CT_INDEX: usize = 1;
pub const CONSUMPTION_TOTAL_INDEX: usize = 0;
pub const CONSUMPTION_NET_INDEX: usize = 1;

/// Raw readings of one power stream, in W and Wh.
#[derive(Clone, Copy, Debug, PartialEq)]
struct RawPower {
    watts_now: f64,
    wh_today: f64,
    wh_last_seven_days: f64,
    wh_lifetime: f64,
}

struct StreamSettings {
    stream: Stream,
    watermark: WatermarkKind,
    max_detected_w: f64,
    lifetime_offset_wh: f64,
}

impl StreamSettings {
    /// Only the metered power streams carry a watermark; storage has no
    /// settings here.
    fn new(config: &DeviceConfig, watermark: WatermarkKind) -> Self {
        let (stream, max_detected_w, lifetime_offset_wh) = match watermark {
            WatermarkKind::ProductionMax => (
                Stream::Production,
                config.production_max_detected,
                config.production_lifetime_offset,
            ),
            WatermarkKind::ConsumptionTotalMax => (
                Stream::ConsumptionTotal,
                config.consumption_total_max_detected,
                config.consumption_total_lifetime_offset,
            ),
            WatermarkKind::ConsumptionNetMax => (
                Stream::ConsumptionNet,
                config.consumption_net_max_detected,
                config.consumption_net_lifetime_offset,
            ),
        };
        Self {
            stream,
            watermark,
            max_detected_w,
            lifetime_offset_wh,
        }
    }
}

/// Result of one successful update cycle, committed to the snapshot in one go.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    pub production: PowerStream,
    pub consumption_total: Option<PowerStream>,
    pub consumption_net: Option<PowerStream>,
    pub storage: Option<StorageStream>,
}

impl UpdateOutcome {
    pub fn apply(self, snapshot: &mut MetricSnapshot) {
        snapshot.production = self.production;
        if let Some(stream) = self.consumption_total {
            snapshot.consumption_total = stream;
        }
        if let Some(stream) = self.consumption_net {
            snapshot.consumption_net = stream;
        }
        if let Some(stream) = self.storage {
            snapshot.storage = stream;
        }
        snapshot.reachable = true;
        snapshot.last_update = Some(Local::now());
    }
}

fn required(value: Option<f64>, field: impl FnOnce() -> String) -> Result<f64> {
    value.ok_or_else(|| EnvoyError::missing(field()))
}

fn entry<'a>(list: &'a [MeterReading], array: &str, index: usize) -> Result<&'a MeterReading> {
    list.get(index)
        .ok_or_else(|| EnvoyError::missing(format!("{}[{}]", array, index)))
}

fn meter_reading(list: &[MeterReading], array: &str, index: usize) -> Result<RawPower> {
    let m = entry(list, array, index)?;
    let field = |name: &'static str| move || format!("{}[{}].{}", array, index, name);
    Ok(RawPower {
        watts_now: required(m.w_now, field("wNow"))?,
        wh_today: required(m.wh_today, field("whToday"))?,
        wh_last_seven_days: required(m.wh_last_seven_days, field("whLastSevenDays"))?,
        wh_lifetime: required(m.wh_lifetime, field("whLifetime"))?,
    })
}

fn production_reading(config: &DeviceConfig, payload: &UpdatePayload) -> Result<RawPower> {
    if !config.legacy_production() {
        return meter_reading(
            &payload.combined.production,
            "production",
            PRODUCTION_CT_INDEX,
        );
    }

    let legacy = payload
        .legacy
        .as_ref()
        .ok_or_else(|| EnvoyError::missing(PRODUCTION))?;
    let field = |name: &'static str| move || format!("{}.{}", PRODUCTION, name);
    Ok(RawPower {
        watts_now: required(legacy.watts_now, field("wattsNow"))?,
        wh_today: required(legacy.watt_hours_today, field("wattHoursToday"))?,
        wh_last_seven_days: required(legacy.watt_hours_seven_days, field("wattHoursSevenDays"))?,
        wh_lifetime: required(legacy.watt_hours_lifetime, field("wattHoursLifetime"))?,
    })
}

/// Storage reports instantaneous power and stored energy only.
fn storage_reading(combined: &CombinedProduction) -> Result<(f64, f64)> {
    let m = entry(&combined.storage, "storage", 0)?;
    Ok((
        required(m.w_now, || "storage[0].wNow".into())?,
        required(m.wh_now, || "storage[0].whNow".into())?,
    ))
}

/// Returns the new running maximum, persisting it when it moved past the stored one.
async fn track_max(
    name: &str,
    store: &WatermarkStore,
    kind: WatermarkKind,
    power_kw: f64,
    in_memory_kw: f64,
) -> f64 {
    let persisted = match store.read(kind).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!("{}: {:?} file does not exist", name, store.path(kind));
            0.0
        }
        Err(e) => {
            error!("{}: {}", name, e);
            0.0
        }
    };

    let max = power_kw.max(persisted).max(in_memory_kw);
    if max > persisted {
        match store.write(kind, max).await {
            Ok(()) => debug!(
                "{}: {:?} saved: {} kW",
                name,
                store.path(kind),
                max
            ),
            // the new maximum is still served until restart
            Err(e) => error!("{}: could not save max power: {}", name, e),
        }
    }
    max
}

async fn reduce_power(
    name: &str,
    store: &WatermarkStore,
    settings: StreamSettings,
    raw: RawPower,
    in_memory_max_kw: f64,
) -> PowerStream {
    let power_now_kw = raw.watts_now / UNIT_DIVISOR;
    let power_max_kw = track_max(name, store, settings.watermark, power_now_kw, in_memory_max_kw).await;

    let stream = PowerStream {
        power_now_kw,
        power_max_kw,
        power_max_detected: power_now_kw >= settings.max_detected_w / UNIT_DIVISOR,
        energy_today_kwh: (raw.wh_today / UNIT_DIVISOR).max(0.0),
        energy_last_seven_days_kwh: (raw.wh_last_seven_days / UNIT_DIVISOR).max(0.0),
        energy_lifetime_kwh: ((raw.wh_lifetime + settings.lifetime_offset_wh) / UNIT_DIVISOR)
            .max(0.0),
    };
    debug!("{}: {} {}", name, settings.stream, stream);
    stream
}

/// Reduces one update cycle's payload into new stream values.
///
/// Every required reading is extracted before any watermark is touched, so a
/// payload with a missing element fails the whole cycle without side effects.
pub async fn reduce_update(
    config: &DeviceConfig,
    payload: &UpdatePayload,
    store: &WatermarkStore,
    previous: &MetricSnapshot,
) -> Result<UpdateOutcome> {
    let combined = &payload.combined;
    let production = production_reading(config, payload)?;
    let consumption_total = if config.has_consumption_total() {
        Some(meter_reading(
            &combined.consumption,
            "consumption",
            CONSUMPTION_TOTAL_INDEX,
        )?)
    } else {
        None
    };
    let consumption_net = if config.has_consumption_net() {
        Some(meter_reading(
            &combined.consumption,
            "consumption",
            CONSUMPTION_NET_INDEX,
        )?)
    } else {
        None
    };
    let storage = if config.encharge_storage {
        Some(storage_reading(combined)?)
    } else {
        None
    };

    let name = config.name.as_str();
    let production = reduce_power(
        name,
        store,
        StreamSettings::new(config, WatermarkKind::ProductionMax),
        production,
        previous.production.power_max_kw,
    )
    .await;

    let consumption_total = match consumption_total {
        Some(raw) => Some(
            reduce_power(
                name,
                store,
                StreamSettings::new(config, WatermarkKind::ConsumptionTotalMax),
                raw,
                previous.consumption_total.power_max_kw,
            )
            .await,
        ),
        None => None,
    };

    let consumption_net = match consumption_net {
        Some(raw) => Some(
            reduce_power(
                name,
                store,
                StreamSettings::new(config, WatermarkKind::ConsumptionNetMax),
                raw,
                previous.consumption_net.power_max_kw,
            )
            .await,
        ),
        None => None,
    };

    // the offset is added after conversion here, unlike the lifetime offsets
    let storage = storage.map(|(watts_now, wh_now)| StorageStream {
        power_now_kw: watts_now / UNIT_DIVISOR,
        energy_today_kwh: (wh_now + config.encharge_storage_offset / UNIT_DIVISOR).max(0.0),
    });
    if let Some(s) = &storage {
        debug!("{}: {} {}", name, Stream::Storage, s);
    }

    Ok(UpdateOutcome {
        production,
        consumption_total,
        consumption_net,
        storage,
    })
}
