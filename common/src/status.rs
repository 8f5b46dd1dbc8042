use std::collections::BTreeMap;

use log::warn;
use serde::Serialize;

use crate::config::NodeConfig;
use crate::door::ActuationQueue;
use crate::routes::RUN_ACK;
use crate::types::{DoorState, Metric, RemoteStatusRecord, SensorReading, UNAVAILABLE};

pub const LOCAL_DEVICE: &str = "loc";
const LOCAL_ALIAS: &str = "local";
const REMOTE_PREFIX: &str = "remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTarget {
    Local,
    Remote(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    label: String,
    target: DeviceTarget,
}

impl DeviceId {
    pub fn local() -> Self {
        Self {
            label: LOCAL_DEVICE.to_string(),
            target: DeviceTarget::Local,
        }
    }

    // `loc`/`local` and absent ids are the hub itself; `remoteN` is the
    // N-th configured peer. Anything else falls back to `remote0`.
    pub fn parse(raw: Option<&str>) -> Self {
        let label = match raw.map(str::trim) {
            None | Some("") => return Self::local(),
            Some(label) => label,
        };

        let target = if label == LOCAL_DEVICE || label == LOCAL_ALIAS {
            DeviceTarget::Local
        } else {
            match label
                .strip_prefix(REMOTE_PREFIX)
                .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|digits| digits.parse::<usize>().ok())
            {
                Some(index) => DeviceTarget::Remote(index),
                None => {
                    warn!("unrecognized device_id {label:?}; using {REMOTE_PREFIX}0");
                    DeviceTarget::Remote(0)
                }
            }
        };

        Self {
            label: label.to_string(),
            target,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> DeviceTarget {
        self.target
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub source: String,
    pub record: RemoteStatusRecord,
}

impl DeviceReport {
    pub fn local(reading: &SensorReading) -> Self {
        Self {
            source: LOCAL_ALIAS.to_string(),
            record: RemoteStatusRecord::from_reading(DoorState::Unknown, reading, None),
        }
    }

    pub fn remote(address: Option<&str>, record: RemoteStatusRecord) -> Self {
        Self {
            source: address.unwrap_or(UNAVAILABLE).to_string(),
            record,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SnapshotField {
    Metric(Metric),
    Label(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: DoorState,
    pub remote_sensor_ip: String,
    pub ip: String,
    pub ow_api_key: String,
    pub station: String,
    pub zipcode: String,
    pub country: String,
    pub version: String,
    // Nanoseconds since the Unix epoch.
    #[serde(rename = "UTC")]
    pub utc: i64,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, SnapshotField>,
}

pub struct StatusAggregator<'a> {
    config: &'a NodeConfig,
    ip: &'a str,
    version: &'a str,
}

impl<'a> StatusAggregator<'a> {
    pub fn new(config: &'a NodeConfig, ip: &'a str, version: &'a str) -> Self {
        Self {
            config,
            ip,
            version,
        }
    }

    pub fn peer_address(&self, device: &DeviceId) -> Option<&'a str> {
        match device.target() {
            DeviceTarget::Local => None,
            DeviceTarget::Remote(index) => {
                let address = self.config.peer_address(index);
                if address.is_none() {
                    warn!(
                        "{} not configured ({} peers)",
                        device.label(),
                        self.config.remote_sensor_ips.len()
                    );
                }
                address
            }
        }
    }

    pub fn snapshot(&self, device: &DeviceId, report: DeviceReport, utc_ns: i64) -> StatusSnapshot {
        let prefix = device.label();
        let record = report.record;

        let mut metrics = BTreeMap::new();
        let mut put = |suffix: &str, field: SnapshotField| {
            metrics.insert(format!("{prefix}{suffix}"), field);
        };
        put("Temp", SnapshotField::Metric(record.temperature));
        put("RH", SnapshotField::Metric(record.relative_humidity));
        put("HI", SnapshotField::Metric(record.heat_index));
        put("Gas", SnapshotField::Metric(record.gas));
        put("IAQ", SnapshotField::Metric(record.iaq));
        put("TVOC", SnapshotField::Metric(record.tvoc));
        put("eCO2", SnapshotField::Metric(record.eco2));
        put("Sens", SnapshotField::Label(record.sensor_type));

        let location = &self.config.location;
        StatusSnapshot {
            state: record.state,
            remote_sensor_ip: report.source,
            ip: self.ip.to_string(),
            ow_api_key: location.ow_api_key.clone(),
            station: location.station.clone(),
            zipcode: location.zipcode.clone(),
            country: location.country.clone(),
            version: self.version.to_string(),
            utc: utc_ns,
            metrics,
        }
    }
}

pub fn handle_run(queue: &ActuationQueue) -> &'static str {
    if !queue.request() {
        warn!("door actuation queue full; press dropped");
    }
    RUN_ACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_device_ids() {
        assert_eq!(DeviceId::parse(None).target(), DeviceTarget::Local);
        assert_eq!(DeviceId::parse(Some("")).label(), LOCAL_DEVICE);
        assert_eq!(DeviceId::parse(Some("loc")).target(), DeviceTarget::Local);
        assert_eq!(DeviceId::parse(Some("local")).target(), DeviceTarget::Local);
        assert_eq!(
            DeviceId::parse(Some("remote1")).target(),
            DeviceTarget::Remote(1)
        );
        assert_eq!(
            DeviceId::parse(Some("remote12")).target(),
            DeviceTarget::Remote(12)
        );
    }

    #[test]
    fn unparseable_ids_fall_back_to_first_peer() {
        for raw in ["remote", "remoteX", "garage", "remote-1"] {
            let device = DeviceId::parse(Some(raw));
            assert_eq!(device.target(), DeviceTarget::Remote(0), "{raw}");
            assert_eq!(device.label(), raw);
        }
    }

    #[test]
    fn local_snapshot_echoes_config_and_prefixes_metrics() {
        let config = NodeConfig::default();
        let aggregator = StatusAggregator::new(&config, "192.168.1.50", "1.2.0");
        let reading = SensorReading::estimate(21.5, Provenance::CpuRaw);

        let snapshot = aggregator.snapshot(
            &DeviceId::parse(Some("loc")),
            DeviceReport::local(&reading),
            1_700_000_000_000_000_000,
        );

        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({
                "state": "N/A",
                "remote_sensor_ip": "local",
                "ip": "192.168.1.50",
                "ow_api_key": "",
                "station": "kbos",
                "zipcode": "02139",
                "country": "US",
                "version": "1.2.0",
                "UTC": 1_700_000_000_000_000_000i64,
                "locTemp": 21.5,
                "locRH": "--",
                "locHI": "--",
                "locGas": "--",
                "locIAQ": "--",
                "locTVOC": "--",
                "loceCO2": "--",
                "locSens": "cpu-raw",
            })
        );
    }

    #[test]
    fn unconfigured_peer_reports_sentinel_without_address() {
        let config = NodeConfig {
            remote_sensor_ips: vec!["10.0.0.7".into()],
            ..NodeConfig::default()
        };
        let aggregator = StatusAggregator::new(&config, "10.0.0.2", "1.2.0");
        let device = DeviceId::parse(Some("remote3"));

        assert_eq!(aggregator.peer_address(&device), None);
        let snapshot = aggregator.snapshot(
            &device,
            DeviceReport::remote(None, RemoteStatusRecord::sentinel()),
            0,
        );

        assert_eq!(snapshot.state, DoorState::Unknown);
        assert_eq!(snapshot.remote_sensor_ip, UNAVAILABLE);
        assert_eq!(
            snapshot.metrics.get("remote3Sens"),
            Some(&SnapshotField::Label(UNAVAILABLE.into()))
        );
    }

    #[test]
    fn remote_snapshot_carries_peer_door_state() {
        let config = NodeConfig::default();
        let aggregator = StatusAggregator::new(&config, "10.0.0.2", "1.2.0");
        let device = DeviceId::parse(Some("remote1"));
        let address = aggregator.peer_address(&device);
        assert_eq!(address, Some("192.168.1.208"));

        let mut record = RemoteStatusRecord::sentinel();
        record.state = DoorState::Open;
        record.temperature = Metric::Value(9.5);
        let snapshot = aggregator.snapshot(&device, DeviceReport::remote(address, record), 5);

        assert_eq!(snapshot.state, DoorState::Open);
        assert_eq!(snapshot.remote_sensor_ip, "192.168.1.208");
        assert_eq!(
            snapshot.metrics.get("remote1Temp"),
            Some(&SnapshotField::Metric(Metric::Value(9.5)))
        );
    }

    #[test]
    fn run_acknowledges_and_queues() {
        let queue = ActuationQueue::new();
        assert_eq!(handle_run(&queue), "OK");
        assert_eq!(queue.pending(), 1);
    }
}
