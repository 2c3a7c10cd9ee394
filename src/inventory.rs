use crate::config::DeviceConfig;
use crate::envoy::InfoPayload;
use crate::metrics::{DeviceInfo, MeterStatus, UnitStatus, UNDEFINED};
use serde_json::Value;

// positions of the device groups in /inventory.json
pub const INVENTORY_INVERTERS: usize = 0;
pub const INVENTORY_ENCHARGES: usize = 1;
pub const INVENTORY_QRELAYS: usize = 2;

// positions of the meters in /ivp/meters
pub const METER_PRODUCTION: usize = 0;
pub const METER_CONSUMPTION: usize = 1;

fn group_devices(inventory: &Value, group: usize) -> &[Value] {
    inventory
        .get(group)
        .and_then(|g| g.get("devices"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn yes_no(device: &Value, key: &str) -> String {
    match device.get(key).and_then(Value::as_bool) {
        Some(true) => "Yes".into(),
        Some(false) => "No".into(),
        None => UNDEFINED.into(),
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| text(Some(v)))
            .collect::<Vec<_>>()
            .join(", "),
        _ => UNDEFINED.into(),
    }
}

/// `device_status` is a list of status codes; the first one is reported.
fn first_status(device: &Value) -> String {
    match device.get("device_status") {
        Some(Value::Array(items)) => text(items.first()),
        other => text(other),
    }
}

fn relay_state(device: &Value) -> String {
    match device.get("relay") {
        Some(Value::Bool(true)) => "Closed".into(),
        Some(Value::Bool(false)) => "Open".into(),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("closed") => "Closed".into(),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("open") => "Open".into(),
        _ => UNDEFINED.into(),
    }
}

fn encharge_status(device: &Value) -> UnitStatus {
    UnitStatus {
        producing: yes_no(device, "producing"),
        communicating: yes_no(device, "communicating"),
        provisioned: yes_no(device, "provisioned"),
        operating: yes_no(device, "operating"),
        device_status: first_status(device),
        ..UnitStatus::default()
    }
}

fn qrelay_status(device: &Value) -> UnitStatus {
    UnitStatus {
        communicating: yes_no(device, "communicating"),
        provisioned: yes_no(device, "provisioned"),
        operating: yes_no(device, "operating"),
        device_status: first_status(device),
        relay: relay_state(device),
        ..UnitStatus::default()
    }
}

fn meter_status(meter: &Value) -> MeterStatus {
    MeterStatus {
        state: match meter.get("state") {
            Some(Value::String(s)) => s == "enabled",
            Some(Value::Bool(b)) => *b,
            _ => false,
        },
        measurement_type: text(meter.get("measurementType")),
        phase_mode: text(meter.get("phaseMode")),
        phase_count: meter
            .get("phaseCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        metering_status: text(meter.get("meteringStatus")),
        status_flags: text(meter.get("statusFlags")),
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty()).map(String::from)
}

/// Best-effort reduction of an info cycle: every field falls back to its
/// default on its own, nothing here fails the cycle.
pub fn reduce_info(config: &DeviceConfig, payload: &InfoPayload) -> DeviceInfo {
    let device = payload.info.device.first();
    let serial_number = non_empty(device.and_then(|d| d.sn.as_ref()))
        .unwrap_or_else(|| config.serial_number.clone());
    let firmware_revision = non_empty(device.and_then(|d| d.software.as_ref()))
        .unwrap_or_else(|| config.firmware_revision.clone());

    let inverters = group_devices(&payload.inventory, INVENTORY_INVERTERS);
    let encharges = group_devices(&payload.inventory, INVENTORY_ENCHARGES);
    let qrelays = group_devices(&payload.inventory, INVENTORY_QRELAYS);
    let meters = payload
        .meters
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();

    DeviceInfo {
        serial_number: Some(serial_number),
        firmware_revision: Some(firmware_revision),
        inverters: Some(inverters.len()),
        encharges: Some(encharges.len()),
        qrelays: Some(qrelays.len()),
        meters: Some(meters.len()),
        encharge: encharges.first().map(encharge_status).unwrap_or_default(),
        qrelay: qrelays.first().map(qrelay_status).unwrap_or_default(),
        production_meter: meters
            .get(METER_PRODUCTION)
            .map(meter_status)
            .unwrap_or_default(),
        consumption_meter: meters
            .get(METER_CONSUMPTION)
            .map(meter_status)
            .unwrap_or_default(),
    }
}

fn count(value: Option<usize>) -> String {
    value.map_or_else(|| UNDEFINED.into(), |n| n.to_string())
}

pub fn log_summary(config: &DeviceConfig, info: &DeviceInfo) {
    let name = &config.name;
    info!("<b>-------- {} --------</>", name);
    info!("{}: manufacturer: {}", name, config.manufacturer);
    info!("{}: model: {}", name, config.model);
    info!(
        "{}: serial number: {}",
        name,
        info.serial_number.as_deref().unwrap_or(UNDEFINED)
    );
    info!(
        "{}: firmware: {}",
        name,
        info.firmware_revision.as_deref().unwrap_or(UNDEFINED)
    );
    info!(
        "{}: inverters: {}, encharges: {}, q-relays: {}, meters: {}",
        name,
        count(info.inverters),
        count(info.encharges),
        count(info.qrelays),
        count(info.meters)
    );
    if info.encharges.unwrap_or(0) > 0 {
        let e = &info.encharge;
        info!(
            "{}: encharge: producing: {}, communicating: {}, provisioned: {}, operating: {}, status: {}",
            name, e.producing, e.communicating, e.provisioned, e.operating, e.device_status
        );
    }
    if info.qrelays.unwrap_or(0) > 0 {
        let q = &info.qrelay;
        info!(
            "{}: q-relay: relay: {}, communicating: {}, provisioned: {}, operating: {}, status: {}",
            name, q.relay, q.communicating, q.provisioned, q.operating, q.device_status
        );
    }
    for (label, meter, position) in [
        ("production meter", &info.production_meter, METER_PRODUCTION),
        ("consumption meter", &info.consumption_meter, METER_CONSUMPTION),
    ] {
        if info.meters.unwrap_or(0) > position {
            info!(
                "{}: {}: {}, enabled: {}, phase mode: {}, phase count: {}, metering status: {}, status flags: {}",
                name,
                label,
                meter.measurement_type,
                meter.state,
                meter.phase_mode,
                meter.phase_count,
                meter.metering_status,
                meter.status_flags
            );
        }
    }
}
