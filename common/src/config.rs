use log::warn;

use crate::error::ConfigError;

pub const KEY_WIFI_SSID: &str = "CIRCUITPY_WIFI_SSID";
pub const KEY_WIFI_PASSWORD: &str = "CIRCUITPY_WIFI_PASSWORD";
pub const KEY_TRIGGER_DISTANCE: &str = "trigger_distance";
pub const KEY_SENSOR1_NAME: &str = "sensor1_name";
pub const KEY_SENSOR1_PINS: &str = "sensor1_pins";
pub const KEY_SENSOR1_CORRECT_TEMP: &str = "sensor1_correct_temp";
pub const KEY_SENSOR1_TEMP_OFFSET: &str = "sensor1_temp_offset";
pub const KEY_SONAR_PINS: &str = "sonar_pins";
pub const KEY_REMOTE_SENSOR_IP: &str = "remote_sensor_ip";
pub const KEY_STATION: &str = "station";
pub const KEY_ZIPCODE: &str = "zipcode";
pub const KEY_COUNTRY: &str = "country";
pub const KEY_OW_API_KEY: &str = "ow_api_key";
pub const KEY_HTTP_PORT: &str = "http_port";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub name: Option<String>,
    pub pins: Vec<i32>,
    pub correct_temp: bool,
    pub temp_offset_c: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: None,
            pins: Vec::new(),
            correct_temp: false,
            temp_offset_c: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationConfig {
    pub station: String,
    pub zipcode: String,
    pub country: String,
    pub ow_api_key: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            station: "kbos".into(),
            zipcode: "02139".into(),
            country: "US".into(),
            ow_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub wifi: Option<WifiCredentials>,
    pub trigger_distance_cm: f32,
    pub sensor1: SensorConfig,
    pub sonar_pins: Vec<i32>,
    pub remote_sensor_ips: Vec<String>,
    pub location: LocationConfig,
    pub http_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            wifi: None,
            trigger_distance_cm: 20.0,
            sensor1: SensorConfig::default(),
            sonar_pins: vec![5, 18],
            remote_sensor_ips: vec!["192.168.1.206".into(), "192.168.1.208".into()],
            location: LocationConfig::default(),
            http_port: 80,
        }
    }
}

impl NodeConfig {
    pub fn load<F>(lookup: F) -> (Self, Vec<ConfigError>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut loader = Loader {
            lookup: &lookup,
            problems: Vec::new(),
        };
        let mut config = Self::default();

        let ssid = loader.text(KEY_WIFI_SSID);
        let password = loader.text(KEY_WIFI_PASSWORD);
        config.wifi = match (ssid, password) {
            (Some(ssid), Some(password)) => Some(WifiCredentials { ssid, password }),
            _ => None,
        };

        if let Some(distance) = loader.parsed::<f32>(KEY_TRIGGER_DISTANCE) {
            config.trigger_distance_cm = distance;
        }

        config.sensor1.name = loader.optional_text(KEY_SENSOR1_NAME);
        if let Some(pins) = loader.pins(KEY_SENSOR1_PINS) {
            config.sensor1.pins = pins;
        }
        if let Some(flag) = loader.flag(KEY_SENSOR1_CORRECT_TEMP) {
            config.sensor1.correct_temp = flag;
        }
        if let Some(raw) = (loader.lookup)(KEY_SENSOR1_TEMP_OFFSET) {
            match raw.trim().parse::<f32>() {
                Ok(offset) => config.sensor1.temp_offset_c = offset,
                Err(_) => loader.invalid(KEY_SENSOR1_TEMP_OFFSET, raw),
            }
        }
        if let Some(raw) = (loader.lookup)(KEY_SONAR_PINS) {
            match parse_pins(&raw) {
                Some(pins) => config.sonar_pins = pins,
                None => loader.invalid(KEY_SONAR_PINS, raw),
            }
        }

        if let Some(raw) = loader.text(KEY_REMOTE_SENSOR_IP) {
            config.remote_sensor_ips = parse_list(&raw);
        }

        if let Some(station) = loader.text(KEY_STATION) {
            config.location.station = station;
        }
        if let Some(zipcode) = loader.text(KEY_ZIPCODE) {
            config.location.zipcode = zipcode;
        }
        if let Some(country) = loader.text(KEY_COUNTRY) {
            config.location.country = country;
        }
        if let Some(key) = (loader.lookup)(KEY_OW_API_KEY) {
            config.location.ow_api_key = key.trim().to_string();
        }
        if let Some(raw) = (loader.lookup)(KEY_HTTP_PORT) {
            match raw.trim().parse::<u16>() {
                Ok(port) => config.http_port = port,
                Err(_) => loader.invalid(KEY_HTTP_PORT, raw),
            }
        }

        config.sanitize(&mut loader.problems);
        for problem in &loader.problems {
            warn!("{problem}");
        }
        (config, loader.problems)
    }

    fn sanitize(&mut self, problems: &mut Vec<ConfigError>) {
        let defaults = Self::default();

        if !self.trigger_distance_cm.is_finite() || self.trigger_distance_cm <= 0.0 {
            problems.push(ConfigError::Invalid {
                key: KEY_TRIGGER_DISTANCE,
                value: self.trigger_distance_cm.to_string(),
            });
            self.trigger_distance_cm = defaults.trigger_distance_cm;
        }

        if !self.sensor1.temp_offset_c.is_finite() {
            self.sensor1.temp_offset_c = 0.0;
        }

        if self.http_port == 0 {
            problems.push(ConfigError::Invalid {
                key: KEY_HTTP_PORT,
                value: "0".into(),
            });
            self.http_port = defaults.http_port;
        }
    }

    pub fn peer_address(&self, index: usize) -> Option<&str> {
        self.remote_sensor_ips.get(index).map(String::as_str)
    }
}

struct Loader<'a, F> {
    lookup: &'a F,
    problems: Vec<ConfigError>,
}

impl<F> Loader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn text(&mut self, key: &'static str) -> Option<String> {
        let value = self.optional_text(key);
        if value.is_none() {
            self.problems.push(ConfigError::Missing { key });
        }
        value
    }

    fn optional_text(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key)
            .map(|raw| raw.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&mut self, key: &'static str) -> Option<T> {
        let raw = self.text(key)?;
        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                self.invalid(key, raw);
                None
            }
        }
    }

    fn pins(&mut self, key: &'static str) -> Option<Vec<i32>> {
        let raw = self.text(key)?;
        let pins = parse_pins(&raw);
        if pins.is_none() {
            self.invalid(key, raw);
        }
        pins
    }

    fn flag(&mut self, key: &'static str) -> Option<bool> {
        let raw = self.text(key)?;
        let flag = parse_flag(&raw);
        if flag.is_none() {
            self.invalid(key, raw);
        }
        flag
    }

    fn invalid(&mut self, key: &'static str, value: String) {
        self.problems.push(ConfigError::Invalid { key, value });
    }
}

// Comma separated GPIO numbers; an optional `GP`/`GPIO` prefix is accepted.
pub fn parse_pins(raw: &str) -> Option<Vec<i32>> {
    parse_list(raw)
        .iter()
        .map(|item| {
            let upper = item.to_ascii_uppercase();
            let digits = upper
                .strip_prefix("GPIO")
                .or_else(|| upper.strip_prefix("GP"))
                .unwrap_or(&upper);
            digits.parse::<i32>().ok().filter(|pin| *pin >= 0)
        })
        .collect()
}

pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> (NodeConfig, Vec<ConfigError>) {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::load(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_settings_fall_back_to_defaults() {
        let (config, problems) = load(&[]);

        assert_eq!(config.wifi, None);
        assert_eq!(config.trigger_distance_cm, 20.0);
        assert_eq!(config.peer_address(0), Some("192.168.1.206"));
        assert_eq!(config.peer_address(1), Some("192.168.1.208"));
        assert_eq!(config.location.station, "kbos");
        assert_eq!(config.location.zipcode, "02139");
        assert!(!config.sensor1.correct_temp);
        assert!(problems.contains(&ConfigError::Missing {
            key: KEY_WIFI_SSID
        }));
    }

    #[test]
    fn reads_full_settings() {
        let (config, problems) = load(&[
            (KEY_WIFI_SSID, "garage-net"),
            (KEY_WIFI_PASSWORD, "hunter2"),
            (KEY_TRIGGER_DISTANCE, "35.5"),
            (KEY_SENSOR1_NAME, "DHT22"),
            (KEY_SENSOR1_PINS, "GP4, 5"),
            (KEY_SENSOR1_CORRECT_TEMP, "True"),
            (KEY_SENSOR1_TEMP_OFFSET, "-1.5"),
            (KEY_REMOTE_SENSOR_IP, " 10.0.0.7 ,,10.0.0.8"),
            (KEY_STATION, "kbed"),
            (KEY_ZIPCODE, "01730"),
            (KEY_COUNTRY, "US"),
            (KEY_OW_API_KEY, "abc123"),
            (KEY_HTTP_PORT, "8080"),
        ]);

        assert_eq!(
            config.wifi,
            Some(WifiCredentials {
                ssid: "garage-net".into(),
                password: "hunter2".into(),
            })
        );
        assert_eq!(config.trigger_distance_cm, 35.5);
        assert_eq!(config.sensor1.name.as_deref(), Some("DHT22"));
        assert_eq!(config.sensor1.pins, vec![4, 5]);
        assert!(config.sensor1.correct_temp);
        assert_eq!(config.sensor1.temp_offset_c, -1.5);
        assert_eq!(config.remote_sensor_ips, vec!["10.0.0.7", "10.0.0.8"]);
        assert_eq!(config.peer_address(2), None);
        assert_eq!(config.location.ow_api_key, "abc123");
        assert_eq!(config.http_port, 8080);
        assert!(problems.is_empty(), "unexpected problems: {problems:?}");
    }

    #[test]
    fn malformed_values_are_reported_and_defaulted() {
        let (config, problems) = load(&[
            (KEY_TRIGGER_DISTANCE, "far"),
            (KEY_SENSOR1_PINS, "4,x"),
            (KEY_SENSOR1_CORRECT_TEMP, "maybe"),
        ]);

        assert_eq!(config.trigger_distance_cm, 20.0);
        assert!(config.sensor1.pins.is_empty());
        assert!(!config.sensor1.correct_temp);
        assert!(problems.contains(&ConfigError::Invalid {
            key: KEY_TRIGGER_DISTANCE,
            value: "far".into(),
        }));
        assert!(problems.contains(&ConfigError::Invalid {
            key: KEY_SENSOR1_PINS,
            value: "4,x".into(),
        }));
    }

    #[test]
    fn non_positive_trigger_distance_is_replaced() {
        let (config, problems) = load(&[(KEY_TRIGGER_DISTANCE, "-3")]);
        assert_eq!(config.trigger_distance_cm, 20.0);
        assert!(problems
            .iter()
            .any(|p| matches!(p, ConfigError::Invalid { key, .. } if *key == KEY_TRIGGER_DISTANCE)));
    }

    #[test]
    fn half_configured_wifi_is_absent() {
        let (config, _) = load(&[(KEY_WIFI_SSID, "garage-net")]);
        assert_eq!(config.wifi, None);
    }
}
