use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use log::{info, warn};

use crate::calibration::{EnvironmentSample, EnvironmentSensor, ReferenceThermometer};
use crate::config::WifiCredentials;
use crate::door::{DoorRelay, SonarProbe};
use crate::error::{RadioError, RelayError, SensorError};
use crate::supervisor::{SystemReset, WifiRadio};

#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(u64::from(ns)));
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackRadio {
    address: Ipv4Addr,
    enabled: bool,
    connected: bool,
}

impl LoopbackRadio {
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            enabled: true,
            connected: false,
        }
    }

    pub fn connected(address: Ipv4Addr) -> Self {
        Self {
            connected: true,
            ..Self::new(address)
        }
    }
}

impl WifiRadio for LoopbackRadio {
    fn is_connected(&mut self) -> bool {
        self.enabled && self.connected
    }

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), RadioError> {
        if !self.enabled {
            return Err(RadioError::Other("radio disabled".into()));
        }
        info!("loopback radio joined {}", credentials.ssid);
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.connected = false;
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), RadioError> {
        self.enabled = enabled;
        if !enabled {
            self.connected = false;
        }
        Ok(())
    }

    fn ipv4_address(&mut self) -> Option<Ipv4Addr> {
        self.is_connected().then_some(self.address)
    }
}

#[derive(Debug, Default)]
pub struct ProcessReset;

impl SystemReset for ProcessReset {
    fn hard_reset(&mut self) {
        warn!("restarting process");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone)]
pub struct HostThermometer {
    zone: PathBuf,
    fallback_c: f32,
}

impl HostThermometer {
    pub fn new(fallback_c: f32) -> Self {
        Self {
            zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            fallback_c,
        }
    }

    pub fn fixed(temperature_c: f32) -> Self {
        Self {
            zone: PathBuf::new(),
            fallback_c: temperature_c,
        }
    }
}

impl ReferenceThermometer for HostThermometer {
    fn temperature_c(&mut self) -> f32 {
        std::fs::read_to_string(&self.zone)
            .ok()
            .and_then(|raw| raw.trim().parse::<f32>().ok())
            .map(|millidegrees| millidegrees / 1_000.0)
            .unwrap_or(self.fallback_c)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    model: String,
    sample: EnvironmentSample,
}

impl SimulatedSensor {
    pub fn new(model: &str, sample: EnvironmentSample) -> Self {
        Self {
            model: model.to_string(),
            sample,
        }
    }
}

impl EnvironmentSensor for SimulatedSensor {
    fn model(&self) -> &str {
        &self.model
    }

    fn read(&mut self) -> Result<EnvironmentSample, SensorError> {
        Ok(self.sample)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulatedSonar {
    pub distance_cm: f32,
}

impl SonarProbe for SimulatedSonar {
    fn distance_cm(&mut self) -> Result<f32, SensorError> {
        Ok(self.distance_cm)
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoggingRelay {
    pub asserted: bool,
    pub presses: u32,
}

impl DoorRelay for LoggingRelay {
    fn set_asserted(&mut self, asserted: bool) -> Result<(), RelayError> {
        info!("door relay {}", if asserted { "closed" } else { "open" });
        if asserted && !self.asserted {
            self.presses += 1;
        }
        self.asserted = asserted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_radio_associates_until_disabled() {
        let mut radio = LoopbackRadio::new(Ipv4Addr::LOCALHOST);
        assert!(!radio.is_connected());

        let credentials = WifiCredentials {
            ssid: "garage-net".into(),
            password: "hunter2".into(),
        };
        radio.connect(&credentials).unwrap();
        assert_eq!(radio.ipv4_address(), Some(Ipv4Addr::LOCALHOST));

        radio.set_enabled(false).unwrap();
        assert!(!radio.is_connected());
        assert!(radio.connect(&credentials).is_err());
    }

    #[test]
    fn fixed_thermometer_ignores_sysfs() {
        assert_eq!(HostThermometer::fixed(33.0).temperature_c(), 33.0);
    }
}
