use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const UNAVAILABLE: &str = "--";

pub fn round_tenths(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Metric {
    Value(f32),
    #[default]
    Unavailable,
}

impl Metric {
    pub fn rounded(value: f32) -> Self {
        Self::from_option(Some(round_tenths(value)))
    }

    pub fn from_option(value: Option<f32>) -> Self {
        match value {
            Some(v) if v.is_finite() => Self::Value(v),
            _ => Self::Unavailable,
        }
    }

    pub fn value(self) -> Option<f32> {
        match self {
            Self::Value(v) => Some(v),
            Self::Unavailable => None,
        }
    }
}

impl Serialize for Metric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) if v.is_finite() => serializer.serialize_f32(*v),
            _ => serializer.serialize_str(UNAVAILABLE),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MetricRepr {
    Number(f64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Peers are not validated beyond parsing; anything non-numeric reads as unavailable.
        Ok(match MetricRepr::deserialize(deserializer)? {
            MetricRepr::Number(v) => Self::from_option(Some(v as f32)),
            MetricRepr::Text(text) => Self::from_option(
                text.split_whitespace()
                    .next()
                    .and_then(|token| token.parse::<f32>().ok()),
            ),
            MetricRepr::Other(_) => Self::Unavailable,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Raw,
    Adjusted,
    CpuRaw,
    CpuAdjusted,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Adjusted => "adjusted",
            Self::CpuRaw => "cpu-raw",
            Self::CpuAdjusted => "cpu-adjusted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DoorState {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
    #[default]
    #[serde(rename = "N/A", other)]
    Unknown,
}

impl DoorState {
    pub fn from_label(label: &str) -> Self {
        match label {
            "OPEN" => Self::Open,
            "CLOSED" => Self::Closed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Unknown => "N/A",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: Metric,
    #[serde(rename = "RH")]
    pub relative_humidity: Metric,
    pub pressure: Metric,
    #[serde(rename = "HI")]
    pub heat_index: Metric,
    pub gas: Metric,
    #[serde(rename = "IAQ")]
    pub iaq: Metric,
    #[serde(rename = "TVOC")]
    pub tvoc: Metric,
    #[serde(rename = "eCO2")]
    pub eco2: Metric,
    #[serde(rename = "type")]
    pub provenance: Provenance,
}

impl SensorReading {
    pub fn estimate(temperature_c: f32, provenance: Provenance) -> Self {
        Self {
            temperature: Metric::rounded(temperature_c),
            relative_humidity: Metric::Unavailable,
            pressure: Metric::Unavailable,
            heat_index: Metric::Unavailable,
            gas: Metric::Unavailable,
            iaq: Metric::Unavailable,
            tvoc: Metric::Unavailable,
            eco2: Metric::Unavailable,
            provenance,
        }
    }
}

fn unavailable_label() -> String {
    UNAVAILABLE.to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LabelRepr {
    Text(String),
    Other(serde::de::IgnoredAny),
}

fn lenient_door_state<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DoorState, D::Error> {
    Ok(match LabelRepr::deserialize(deserializer)? {
        LabelRepr::Text(label) => DoorState::from_label(&label),
        LabelRepr::Other(_) => DoorState::Unknown,
    })
}

fn lenient_label<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match LabelRepr::deserialize(deserializer)? {
        LabelRepr::Text(label) => label,
        LabelRepr::Other(_) => unavailable_label(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatusRecord {
    #[serde(default, deserialize_with = "lenient_door_state")]
    pub state: DoorState,
    #[serde(default)]
    pub temperature: Metric,
    #[serde(rename = "RH", default)]
    pub relative_humidity: Metric,
    #[serde(default)]
    pub pressure: Metric,
    #[serde(rename = "HI", default)]
    pub heat_index: Metric,
    #[serde(default)]
    pub gas: Metric,
    #[serde(rename = "IAQ", default)]
    pub iaq: Metric,
    #[serde(rename = "TVOC", default)]
    pub tvoc: Metric,
    #[serde(rename = "eCO2", default)]
    pub eco2: Metric,
    #[serde(
        rename = "type",
        default = "unavailable_label",
        deserialize_with = "lenient_label"
    )]
    pub sensor_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RemoteStatusRecord {
    pub fn sentinel() -> Self {
        Self {
            state: DoorState::Unknown,
            temperature: Metric::Unavailable,
            relative_humidity: Metric::Unavailable,
            pressure: Metric::Unavailable,
            heat_index: Metric::Unavailable,
            gas: Metric::Unavailable,
            iaq: Metric::Unavailable,
            tvoc: Metric::Unavailable,
            eco2: Metric::Unavailable,
            sensor_type: unavailable_label(),
            version: None,
        }
    }

    pub fn from_reading(state: DoorState, reading: &SensorReading, version: Option<&str>) -> Self {
        Self {
            state,
            temperature: reading.temperature,
            relative_humidity: reading.relative_humidity,
            pressure: reading.pressure,
            heat_index: reading.heat_index,
            gas: reading.gas,
            iaq: reading.iaq,
            tvoc: reading.tvoc,
            eco2: reading.eco2,
            sensor_type: reading.provenance.as_str().to_string(),
            version: version.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn unavailable_metrics_serialize_as_placeholder() {
        let reading = SensorReading::estimate(27.46, Provenance::CpuRaw);
        let value = serde_json::to_value(&reading).unwrap();

        assert_eq!(value["temperature"], json!(27.5));
        assert_eq!(value["RH"], json!("--"));
        assert_eq!(value["eCO2"], json!("--"));
        assert_eq!(value["type"], json!("cpu-raw"));
    }

    #[test]
    fn sentinel_matches_peer_wire_shape() {
        let value = serde_json::to_value(RemoteStatusRecord::sentinel()).unwrap();
        assert_eq!(
            value,
            json!({
                "state": "N/A",
                "temperature": "--",
                "RH": "--",
                "pressure": "--",
                "HI": "--",
                "gas": "--",
                "IAQ": "--",
                "TVOC": "--",
                "eCO2": "--",
                "type": "--",
            })
        );
    }

    #[test]
    fn peer_record_tolerates_missing_and_odd_fields() {
        let record: RemoteStatusRecord = serde_json::from_value(json!({
            "state": "OPEN",
            "temperature": 18.25,
            "RH": "41.0",
            "HI": "--",
            "IAQ": null,
            "type": "raw",
            "extra": true,
        }))
        .unwrap();

        assert_eq!(record.state, DoorState::Open);
        assert_eq!(record.temperature, Metric::Value(18.25));
        assert_eq!(record.relative_humidity, Metric::Value(41.0));
        assert_eq!(record.heat_index, Metric::Unavailable);
        assert_eq!(record.iaq, Metric::Unavailable);
        assert_eq!(record.pressure, Metric::Unavailable);
        assert_eq!(record.sensor_type, "raw");
    }

    #[test]
    fn odd_state_and_type_do_not_discard_the_record() {
        let record: RemoteStatusRecord = serde_json::from_value(json!({
            "state": null,
            "temperature": 12.5,
            "type": 3,
        }))
        .unwrap();
        assert_eq!(record.state, DoorState::Unknown);
        assert_eq!(record.temperature, Metric::Value(12.5));
        assert_eq!(record.sensor_type, UNAVAILABLE);

        let record: RemoteStatusRecord = serde_json::from_value(json!({
            "state": "OPEN",
            "temperature": 12.5,
            "type": 3,
        }))
        .unwrap();
        assert_eq!(record.state, DoorState::Open);
        assert_eq!(record.temperature, Metric::Value(12.5));
    }

    #[test]
    fn unknown_door_state_reads_as_not_available() {
        let state: DoorState = serde_json::from_value(json!("AJAR")).unwrap();
        assert_eq!(state, DoorState::Unknown);
        assert_eq!(serde_json::to_value(state).unwrap(), json!("N/A"));
    }

    #[test]
    fn non_finite_values_are_unavailable() {
        assert_eq!(Metric::from_option(Some(f32::NAN)), Metric::Unavailable);
        assert_eq!(
            serde_json::to_value(Metric::Value(f32::INFINITY)).unwrap(),
            json!("--")
        );
    }
}
