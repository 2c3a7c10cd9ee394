use crate::config::DeviceConfig;
use crate::envoy::TelemetrySource;
use crate::inventory::{log_summary, reduce_info};
use crate::metrics::{
    DeviceInfo, MetricKind, MetricService, MetricSnapshot, MetricValue, Stream,
};
use crate::reducer::reduce_update;
use crate::scheduler::{CycleRunner, PollState, Scheduler};
use crate::watermark::WatermarkStore;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::convert::Infallible;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

/// Getter result: reads never fail, they fall back to defaults.
pub type Reading<T> = std::result::Result<T, Infallible>;

/// Push side of the facade, notified after every successful cycle.
pub trait MetricsListener: Send + Sync {
    fn metrics_updated(&self, name: &str, snapshot: &MetricSnapshot);

    fn info_updated(&self, _name: &str, _info: &DeviceInfo) {}
}

/// Dumps every new snapshot to the debug log.
pub struct LogListener;

impl MetricsListener for LogListener {
    fn metrics_updated(&self, name: &str, snapshot: &MetricSnapshot) {
        debug!("{}: <blue>production</>: {}", name, snapshot.production);
        debug!("{}: total consumption: {}", name, snapshot.consumption_total);
        debug!("{}: net consumption: {}", name, snapshot.consumption_net);
        debug!("{}: storage: {}", name, snapshot.storage);
    }
}

pub struct EnvoyDevice<S: TelemetrySource> {
    pub name: String,
    config: DeviceConfig,
    source: S,
    store: WatermarkStore,
    snapshot: RwLock<MetricSnapshot>,
    listeners: Vec<Box<dyn MetricsListener>>,
    scheduler: Scheduler,
}

macro_rules! float_getter {
    ($fn_name:ident, $stream:expr, $kind:expr) => {
        pub fn $fn_name(&self) -> Reading<f64> {
            match self.read($stream, $kind)? {
                MetricValue::Float(v) => Ok(v),
                MetricValue::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            }
        }
    };
}

macro_rules! bool_getter {
    ($fn_name:ident, $stream:expr) => {
        pub fn $fn_name(&self) -> Reading<bool> {
            match self.read($stream, MetricKind::PowerMaxDetected)? {
                MetricValue::Bool(b) => Ok(b),
                MetricValue::Float(v) => Ok(v != 0.0),
            }
        }
    };
}

impl<S: TelemetrySource> EnvoyDevice<S> {
    /// Prepares the watermark directory; failing to do so only costs
    /// durability of the maxima, so it is logged and otherwise ignored.
    pub fn new(config: DeviceConfig, source: S, storage_path: impl AsRef<Path>) -> Self {
        let store = WatermarkStore::new(storage_path, &config.host);
        match store.prepare() {
            Ok(()) => debug!("{}: watermark directory: {:?}", config.name, store.dir()),
            Err(e) => error!("{}: {}", config.name, e),
        }

        Self {
            name: config.name.clone(),
            scheduler: Scheduler::new(config.name.clone(), config.poll_interval()),
            config,
            source,
            store,
            snapshot: RwLock::new(MetricSnapshot::default()),
            listeners: vec![],
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn MetricsListener>) {
        self.listeners.push(listener);
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> PollState {
        self.scheduler.state()
    }

    pub async fn worker(&self, worker_cancel_flag: Arc<AtomicBool>) {
        self.scheduler.run(self, worker_cancel_flag).await;
    }

    // readers never observe a half-written snapshot, a poisoned lock still
    // holds the last complete one
    fn current(&self) -> RwLockReadGuard<'_, MetricSnapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        self.current().clone()
    }

    pub fn services(&self) -> Vec<MetricService> {
        let mut services = vec![MetricService::for_stream(Stream::Production)];
        if self.config.has_consumption_total() {
            services.push(MetricService::for_stream(Stream::ConsumptionTotal));
        }
        if self.config.has_consumption_net() {
            services.push(MetricService::for_stream(Stream::ConsumptionNet));
        }
        if self.config.encharge_storage {
            services.push(MetricService::for_stream(Stream::Storage));
        }
        services
    }

    pub fn read(&self, stream: Stream, kind: MetricKind) -> Reading<MetricValue> {
        let value = self.current().value(stream, kind);
        trace!("{}: read {} {:?}: {:?}", self.name, stream, kind, value);
        Ok(value)
    }

    float_getter!(power_production, Stream::Production, MetricKind::Power);
    float_getter!(power_production_max, Stream::Production, MetricKind::PowerMax);
    bool_getter!(power_production_max_detected, Stream::Production);
    float_getter!(energy_production_today, Stream::Production, MetricKind::EnergyToday);
    float_getter!(energy_production_last_seven_days, Stream::Production, MetricKind::EnergyLastSevenDays);
    float_getter!(energy_production_lifetime, Stream::Production, MetricKind::EnergyLifetime);

    float_getter!(power_consumption_total, Stream::ConsumptionTotal, MetricKind::Power);
    float_getter!(power_consumption_total_max, Stream::ConsumptionTotal, MetricKind::PowerMax);
    bool_getter!(power_consumption_total_max_detected, Stream::ConsumptionTotal);
    float_getter!(energy_consumption_total_today, Stream::ConsumptionTotal, MetricKind::EnergyToday);
    float_getter!(energy_consumption_total_last_seven_days, Stream::ConsumptionTotal, MetricKind::EnergyLastSevenDays);
    float_getter!(energy_consumption_total_lifetime, Stream::ConsumptionTotal, MetricKind::EnergyLifetime);

    float_getter!(power_consumption_net, Stream::ConsumptionNet, MetricKind::Power);
    float_getter!(power_consumption_net_max, Stream::ConsumptionNet, MetricKind::PowerMax);
    bool_getter!(power_consumption_net_max_detected, Stream::ConsumptionNet);
    float_getter!(energy_consumption_net_today, Stream::ConsumptionNet, MetricKind::EnergyToday);
    float_getter!(energy_consumption_net_last_seven_days, Stream::ConsumptionNet, MetricKind::EnergyLastSevenDays);
    float_getter!(energy_consumption_net_lifetime, Stream::ConsumptionNet, MetricKind::EnergyLifetime);

    float_getter!(power_encharge_storage, Stream::Storage, MetricKind::Power);
    float_getter!(energy_encharge_storage, Stream::Storage, MetricKind::EnergyToday);

    pub fn manufacturer(&self) -> Reading<String> {
        Ok(self.config.manufacturer.clone())
    }

    pub fn model(&self) -> Reading<String> {
        Ok(self.config.model.clone())
    }

    pub fn serial_number(&self) -> Reading<String> {
        Ok(self
            .current()
            .info
            .serial_number
            .clone()
            .unwrap_or_else(|| self.config.serial_number.clone()))
    }

    pub fn firmware_revision(&self) -> Reading<String> {
        Ok(self
            .current()
            .info
            .firmware_revision
            .clone()
            .unwrap_or_else(|| self.config.firmware_revision.clone()))
    }

    pub fn is_reachable(&self) -> bool {
        self.current().reachable
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.current().last_update
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.current().info.clone()
    }
}

#[async_trait]
impl<S: TelemetrySource> CycleRunner for EnvoyDevice<S> {
    async fn info_cycle(&self) -> bool {
        let payload = match self.source.fetch_info().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}: info cycle failed: {}", self.name, e);
                return false;
            }
        };

        let info = reduce_info(&self.config, &payload);
        log_summary(&self.config, &info);
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .info = info.clone();
        for listener in &self.listeners {
            listener.info_updated(&self.name, &info);
        }
        true
    }

    async fn update_cycle(&self) -> bool {
        let payload = match self.source.fetch_update().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("{}: update cycle failed: {}", self.name, e);
                return false;
            }
        };

        // cycles never overlap, nothing else writes the snapshot meanwhile
        let previous = self.snapshot();
        let outcome = match reduce_update(&self.config, &payload, &self.store, &previous).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{}: update cycle failed: {}", self.name, e);
                return false;
            }
        };

        let snapshot = {
            let mut current = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            outcome.apply(&mut current);
            current.clone()
        };
        for listener in &self.listeners {
            listener.metrics_updated(&self.name, &snapshot);
        }
        true
    }
}
