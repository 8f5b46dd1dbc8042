use core::convert::TryInto;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dht_sensor::{dht11, dht22};
use ds18b20::{Ds18b20, Resolution};
use embedded_hal::delay::DelayNs;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::Read,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyInputPin, AnyOutputPin, Input, InputOutput, Output, PinDriver, Pull},
    temp_sensor::{TempSensor, TempSensorConfig, TempSensorDriver},
};
use esp_idf_svc::{
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    io::EspIOError,
    sys,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use crate::calibration::{EnvironmentSample, EnvironmentSensor, ReferenceThermometer};
use crate::config::{SensorConfig, WifiCredentials};
use crate::door::{DoorRelay, SonarProbe};
use crate::error::{
    error_chain, is_benign_transport_error, RadioError, RelayError, RemoteFetchError, SensorError,
};
use crate::remote::PeerTransport;
use crate::supervisor::{ResetCause, SystemReset, WifiRadio};

pub struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl EspRadio {
    pub fn new(wifi: BlockingWifi<EspWifi<'static>>) -> Self {
        Self { wifi }
    }
}

impl WifiRadio for EspRadio {
    fn is_connected(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), RadioError> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Other("wifi ssid too long".into()))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Other("wifi password too long".into()))?,
            auth_method,
            ..Default::default()
        });

        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| RadioError::Other(err.to_string()))?;
        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi
                .start()
                .map_err(|err| RadioError::Other(err.to_string()))?;
        }

        self.wifi
            .connect()
            .map_err(|err| RadioError::Connection(err.to_string()))?;
        self.wifi
            .wait_netif_up()
            .map_err(|err| RadioError::Connection(err.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.wifi
            .disconnect()
            .map_err(|err| RadioError::Other(err.to_string()))
    }

    fn set_enabled(&mut self, enabled: bool) -> Result<(), RadioError> {
        let result = if enabled {
            self.wifi.start()
        } else {
            self.wifi.stop()
        };
        result.map_err(|err| RadioError::Other(err.to_string()))
    }

    fn ipv4_address(&mut self) -> Option<Ipv4Addr> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }
}

pub struct EspReset;

impl SystemReset for EspReset {
    fn hard_reset(&mut self) {
        warn!("restarting chip");
        unsafe { sys::esp_restart() };
    }
}

pub fn last_reset_cause() -> ResetCause {
    let reason = unsafe { sys::esp_reset_reason() };
    #[allow(non_upper_case_globals)]
    match reason {
        sys::esp_reset_reason_t_ESP_RST_POWERON => ResetCause::PowerOn,
        sys::esp_reset_reason_t_ESP_RST_SW => ResetCause::Software,
        sys::esp_reset_reason_t_ESP_RST_PANIC => ResetCause::Panic,
        sys::esp_reset_reason_t_ESP_RST_INT_WDT
        | sys::esp_reset_reason_t_ESP_RST_TASK_WDT
        | sys::esp_reset_reason_t_ESP_RST_WDT => ResetCause::Watchdog,
        sys::esp_reset_reason_t_ESP_RST_BROWNOUT => ResetCause::Brownout,
        _ => ResetCause::Unknown,
    }
}

pub struct ChipThermometer {
    driver: TempSensorDriver<'static>,
    last_c: f32,
}

impl ChipThermometer {
    pub fn new(sensor: TempSensor) -> Result<Self, SensorError> {
        let init_error = |err: sys::EspError| SensorError::Init {
            model: "cpu".into(),
            reason: err.to_string(),
        };
        let mut driver =
            TempSensorDriver::new(&TempSensorConfig::default(), sensor).map_err(init_error)?;
        driver.enable().map_err(init_error)?;
        let last_c = driver.get_celsius().map_err(init_error)?;
        Ok(Self { driver, last_c })
    }
}

impl ReferenceThermometer for ChipThermometer {
    fn temperature_c(&mut self) -> f32 {
        match self.driver.get_celsius() {
            Ok(value) => self.last_c = value,
            Err(err) => warn!("chip temperature read failed: {err}"),
        }
        self.last_c
    }
}

pub enum PrimarySensor {
    Ds18b20 {
        one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
        address: Option<Address>,
        pin: i32,
    },
    Dht11 {
        pin: PinDriver<'static, AnyIOPin, InputOutput>,
    },
    Dht22 {
        pin: PinDriver<'static, AnyIOPin, InputOutput>,
    },
}

impl PrimarySensor {
    pub fn from_config(config: &SensorConfig) -> Result<Option<Self>, SensorError> {
        let Some(name) = config.name.as_deref() else {
            return Ok(None);
        };
        let model = name.trim().to_ascii_uppercase();
        let init_error = |reason: String| SensorError::Init {
            model: model.clone(),
            reason,
        };

        let pin = *config
            .pins
            .first()
            .ok_or_else(|| init_error("sensor1_pins is empty".into()))?;
        let mut line = unsafe { PinDriver::input_output_od(AnyIOPin::new(pin)) }
            .map_err(|err| init_error(err.to_string()))?;
        line.set_pull(Pull::Up)
            .map_err(|err| init_error(err.to_string()))?;
        line.set_high().map_err(|err| init_error(err.to_string()))?;

        let sensor = match model.as_str() {
            "DS18B20" => {
                let one_wire =
                    OneWire::new(line).map_err(|err| init_error(format!("{err:?}")))?;
                let mut sensor = Self::Ds18b20 {
                    one_wire,
                    address: None,
                    pin,
                };
                sensor.scan_one_wire();
                sensor
            }
            "DHT11" => Self::Dht11 { pin: line },
            "DHT22" | "AM2302" => Self::Dht22 { pin: line },
            _ => return Err(init_error(format!("unsupported model on GPIO{pin}"))),
        };
        info!("{model} configured on GPIO{pin}");
        Ok(Some(sensor))
    }

    fn scan_one_wire(&mut self) {
        let Self::Ds18b20 {
            one_wire,
            address,
            pin,
        } = self
        else {
            return;
        };

        *address = None;
        for found in one_wire.devices(false, &mut Ets) {
            match found {
                Ok(candidate) if candidate.family_code() == ds18b20::FAMILY_CODE => {
                    *address = Some(candidate);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire scan on GPIO{pin} failed: {err:?}");
                    break;
                }
            }
        }
        if address.is_none() {
            warn!("no DS18B20 found on GPIO{pin}");
        }
    }

    fn read_ds18b20(&mut self) -> Result<EnvironmentSample, SensorError> {
        if matches!(self, Self::Ds18b20 { address: None, .. }) {
            self.scan_one_wire();
        }
        let Self::Ds18b20 {
            one_wire, address, ..
        } = self
        else {
            return Err(read_error("DS18B20", "not a one-wire sensor".into()));
        };
        let found = address.ok_or_else(|| read_error("DS18B20", "no device on bus".into()))?;

        let sensor = Ds18b20::new::<core::convert::Infallible>(found)
            .map_err(|err| read_error("DS18B20", format!("{err:?}")))?;
        let measured = ds18b20::start_simultaneous_temp_measurement(one_wire, &mut Ets)
            .and_then(|()| {
                Resolution::Bits12.delay_for_measurement_time(&mut Ets);
                sensor.read_data(one_wire, &mut Ets)
            });

        match measured {
            Ok(data) => Ok(EnvironmentSample {
                temperature_c: data.temperature,
                ..EnvironmentSample::default()
            }),
            Err(err) => {
                *address = None;
                Err(read_error("DS18B20", format!("{err:?}")))
            }
        }
    }
}

fn read_error(model: &str, reason: String) -> SensorError {
    SensorError::Read {
        model: model.to_string(),
        reason,
    }
}

impl EnvironmentSensor for PrimarySensor {
    fn model(&self) -> &str {
        match self {
            Self::Ds18b20 { .. } => "DS18B20",
            Self::Dht11 { .. } => "DHT11",
            Self::Dht22 { .. } => "DHT22",
        }
    }

    fn read(&mut self) -> Result<EnvironmentSample, SensorError> {
        match self {
            Self::Ds18b20 { .. } => self.read_ds18b20(),
            Self::Dht11 { pin } => {
                let reading = dht11::blocking::read(&mut Ets, pin)
                    .map_err(|err| read_error("DHT11", format!("{err:?}")))?;
                Ok(EnvironmentSample {
                    temperature_c: f32::from(reading.temperature),
                    relative_humidity: Some(f32::from(reading.relative_humidity)),
                    ..EnvironmentSample::default()
                })
            }
            Self::Dht22 { pin } => {
                let reading = dht22::blocking::read(&mut Ets, pin)
                    .map_err(|err| read_error("DHT22", format!("{err:?}")))?;
                Ok(EnvironmentSample {
                    temperature_c: reading.temperature,
                    relative_humidity: Some(reading.relative_humidity),
                    ..EnvironmentSample::default()
                })
            }
        }
    }
}

// Longest echo we wait for, roughly five metres out and back.
const ECHO_TIMEOUT: Duration = Duration::from_millis(30);
const ECHO_US_PER_CM: f32 = 58.0;

pub struct HcSr04 {
    trigger: PinDriver<'static, AnyOutputPin, Output>,
    echo: PinDriver<'static, AnyInputPin, Input>,
}

impl HcSr04 {
    pub fn new(trigger_pin: i32, echo_pin: i32) -> Result<Self, SensorError> {
        let init_error = |err: sys::EspError| SensorError::Init {
            model: "HC-SR04".into(),
            reason: err.to_string(),
        };
        let mut trigger =
            unsafe { PinDriver::output(AnyOutputPin::new(trigger_pin)) }.map_err(init_error)?;
        trigger.set_low().map_err(init_error)?;
        let echo = unsafe { PinDriver::input(AnyInputPin::new(echo_pin)) }.map_err(init_error)?;
        info!("HC-SR04 on trigger GPIO{trigger_pin}, echo GPIO{echo_pin}");
        Ok(Self { trigger, echo })
    }

    fn wait_for_echo(&self, high: bool, since: Instant) -> Result<Instant, SensorError> {
        while self.echo.is_high() != high {
            if since.elapsed() > ECHO_TIMEOUT {
                return Err(read_error("HC-SR04", "echo timed out".into()));
            }
        }
        Ok(Instant::now())
    }
}

impl SonarProbe for HcSr04 {
    fn distance_cm(&mut self) -> Result<f32, SensorError> {
        let write_error = |err: sys::EspError| read_error("HC-SR04", err.to_string());
        self.trigger.set_high().map_err(write_error)?;
        Ets.delay_us(10);
        self.trigger.set_low().map_err(write_error)?;

        let started = self.wait_for_echo(true, Instant::now())?;
        let ended = self.wait_for_echo(false, started)?;
        let micros = ended.duration_since(started).as_micros() as f32;
        Ok(micros / ECHO_US_PER_CM)
    }
}

pub struct GpioRelay {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioRelay {
    pub fn new(gpio: i32) -> Result<Self, RelayError> {
        let mut pin = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }
            .map_err(|err| RelayError::Write(err.to_string()))?;
        pin.set_low()
            .map_err(|err| RelayError::Write(err.to_string()))?;
        Ok(Self { pin })
    }
}

impl DoorRelay for GpioRelay {
    fn set_asserted(&mut self, asserted: bool) -> Result<(), RelayError> {
        let result = if asserted {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|err| RelayError::Write(err.to_string()))
    }
}

const MAX_PEER_BODY: usize = 4096;

#[derive(Default)]
pub struct EspPeerTransport;

fn fetch_error(err: EspIOError) -> RemoteFetchError {
    let code = err.0.code();
    if code == sys::ESP_ERR_HTTP_EAGAIN || code == sys::ESP_ERR_TIMEOUT {
        RemoteFetchError::Timeout
    } else {
        RemoteFetchError::Transport(format!("{err:?}"))
    }
}

impl PeerTransport for EspPeerTransport {
    fn get(&mut self, url: &str, timeout: Duration) -> Result<Vec<u8>, RemoteFetchError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(timeout),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| RemoteFetchError::Transport(err.to_string()))?;
        let mut client = HttpClient::wrap(connection);
        let mut response = client
            .request(Method::Get, url, &[])
            .map_err(fetch_error)?
            .submit()
            .map_err(fetch_error)?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(RemoteFetchError::Status(status));
        }

        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(fetch_error)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_PEER_BODY {
                return Err(RemoteFetchError::Decode("peer body too large".into()));
            }
            body.extend_from_slice(&chunk[..read]);
        }
        Ok(body)
    }
}

// Client hung up before the response was written.
pub fn is_client_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    is_benign_transport_error(err)
        || error_chain(err).any(|cause| {
            cause
                .downcast_ref::<EspIOError>()
                .is_some_and(|io_err| io_err.0.code() == sys::ESP_ERR_HTTPD_RESP_SEND)
        })
}

pub fn init_watchdog(timeout_sec: u32) -> Result<(), sys::EspError> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    accept_reinit(unsafe { sys::esp_task_wdt_init(&config) })
}

pub fn add_current_task_to_watchdog() -> Result<(), sys::EspError> {
    accept_reinit(unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) })
}

fn accept_reinit(rc: sys::esp_err_t) -> Result<(), sys::EspError> {
    if rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    sys::esp!(rc)
}

pub fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
}

pub fn disable_wifi_power_save() {
    let rc = unsafe { sys::esp_wifi_set_ps(0) };
    if rc == sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

pub fn build_setting(key: &str) -> Option<String> {
    let value = match key {
        crate::config::KEY_WIFI_SSID => option_env!("CIRCUITPY_WIFI_SSID"),
        crate::config::KEY_WIFI_PASSWORD => option_env!("CIRCUITPY_WIFI_PASSWORD"),
        crate::config::KEY_TRIGGER_DISTANCE => option_env!("trigger_distance"),
        crate::config::KEY_SENSOR1_NAME => option_env!("sensor1_name"),
        crate::config::KEY_SENSOR1_PINS => option_env!("sensor1_pins"),
        crate::config::KEY_SENSOR1_CORRECT_TEMP => option_env!("sensor1_correct_temp"),
        crate::config::KEY_SENSOR1_TEMP_OFFSET => option_env!("sensor1_temp_offset"),
        crate::config::KEY_SONAR_PINS => option_env!("sonar_pins"),
        crate::config::KEY_REMOTE_SENSOR_IP => option_env!("remote_sensor_ip"),
        crate::config::KEY_STATION => option_env!("station"),
        crate::config::KEY_ZIPCODE => option_env!("zipcode"),
        crate::config::KEY_COUNTRY => option_env!("country"),
        crate::config::KEY_OW_API_KEY => option_env!("ow_api_key"),
        crate::config::KEY_HTTP_PORT => option_env!("http_port"),
        _ => None,
    };
    value.map(str::to_string)
}
