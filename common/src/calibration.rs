use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::types::{round_tenths, Metric, Provenance, SensorReading};

pub const SENSOR_DWELL_MS: u32 = 500;
// When the sample count reaches this value it drops back to `SAMPLE_COUNT_RESUME`.
pub const SAMPLE_COUNT_CEILING: u32 = 20;
pub const SAMPLE_COUNT_RESUME: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    running_offset: f32,
    sample_count: u32,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            running_offset: 0.0,
            sample_count: 1,
        }
    }
}

impl CalibrationState {
    pub fn new(running_offset: f32, sample_count: u32) -> Self {
        Self {
            running_offset,
            sample_count: sample_count.clamp(1, SAMPLE_COUNT_CEILING - 1),
        }
    }

    pub fn running_offset(&self) -> f32 {
        self.running_offset
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn record(&mut self, delta: f32) {
        let n = self.sample_count as f32;
        self.running_offset = (self.running_offset * n + delta) / (n + 1.0);
        self.sample_count += 1;
        if self.sample_count >= SAMPLE_COUNT_CEILING {
            self.sample_count = SAMPLE_COUNT_RESUME;
        }
    }

    pub fn has_estimate(&self) -> bool {
        self.sample_count > 1 && self.running_offset != 0.0
    }

    pub fn estimate(&self, reference_c: f32) -> f32 {
        reference_c - self.running_offset
    }
}

pub trait ReferenceThermometer {
    fn temperature_c(&mut self) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentSample {
    pub temperature_c: f32,
    pub relative_humidity: Option<f32>,
    pub pressure_hpa: Option<f32>,
    pub gas_ohms: Option<f32>,
    pub iaq: Option<f32>,
    pub tvoc_ppb: Option<f32>,
    pub eco2_ppm: Option<f32>,
}

pub trait EnvironmentSensor {
    fn model(&self) -> &str;
    fn read(&mut self) -> Result<EnvironmentSample, SensorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationEngine {
    state: CalibrationState,
    temp_offset_c: f32,
}

impl CalibrationEngine {
    pub fn new(state: CalibrationState, temp_offset_c: f32) -> Self {
        Self {
            state,
            temp_offset_c,
        }
    }

    pub fn seeded<R, S>(reference: &mut R, sensor: Option<&mut S>, temp_offset_c: f32) -> Self
    where
        R: ReferenceThermometer,
        S: EnvironmentSensor,
    {
        let offset = match sensor.map(|s| s.read()) {
            Some(Ok(sample)) => reference.temperature_c() - sample.temperature_c,
            Some(Err(err)) => {
                warn!("calibration seed skipped: {err}");
                0.0
            }
            None => 0.0,
        };
        Self::new(CalibrationState::new(offset, 1), temp_offset_c)
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    // Reads the environment, keeping the reference offset current. Never
    // fails: a missing or failing sensor degrades to a reference estimate.
    pub fn read_environment<R, S, D>(
        &mut self,
        reference: &mut R,
        sensor: Option<&mut S>,
        correct_temp: bool,
        delay: &mut D,
    ) -> SensorReading
    where
        R: ReferenceThermometer,
        S: EnvironmentSensor,
        D: DelayNs,
    {
        let reference_c = reference.temperature_c();

        let Some(sensor) = sensor else {
            debug!("primary sensor not initialized; using reference thermometer");
            return if self.state.has_estimate() {
                SensorReading::estimate(self.state.estimate(reference_c), Provenance::CpuAdjusted)
            } else {
                SensorReading::estimate(reference_c, Provenance::CpuRaw)
            };
        };

        let result = sensor.read();
        delay.delay_ms(SENSOR_DWELL_MS);

        match result {
            Ok(sample) => {
                let (temperature_c, provenance) = if correct_temp {
                    (sample.temperature_c + self.temp_offset_c, Provenance::Adjusted)
                } else {
                    (sample.temperature_c, Provenance::Raw)
                };
                self.state.record(reference_c - temperature_c);
                info!(
                    "{} {:.1}C, reference offset {:.2}C over {} samples",
                    sensor.model(),
                    temperature_c,
                    self.state.running_offset(),
                    self.state.sample_count()
                );
                reading_from_sample(temperature_c, &sample, provenance)
            }
            Err(err) => {
                warn!(
                    "{err}; estimating from reference (offset {:.2}C)",
                    self.state.running_offset()
                );
                SensorReading::estimate(self.state.estimate(reference_c), Provenance::CpuAdjusted)
            }
        }
    }
}

pub struct LocalEnvironment<R, S> {
    engine: CalibrationEngine,
    reference: R,
    sensor: Option<S>,
    correct_temp: bool,
}

impl<R, S> LocalEnvironment<R, S>
where
    R: ReferenceThermometer,
    S: EnvironmentSensor,
{
    pub fn new(mut reference: R, mut sensor: Option<S>, config: &SensorConfig) -> Self {
        let engine = CalibrationEngine::seeded(&mut reference, sensor.as_mut(), config.temp_offset_c);
        Self {
            engine,
            reference,
            sensor,
            correct_temp: config.correct_temp,
        }
    }

    pub fn read<D: DelayNs>(&mut self, delay: &mut D) -> SensorReading {
        self.engine.read_environment(
            &mut self.reference,
            self.sensor.as_mut(),
            self.correct_temp,
            delay,
        )
    }

    pub fn calibration(&self) -> CalibrationState {
        self.engine.state()
    }
}

fn reading_from_sample(
    temperature_c: f32,
    sample: &EnvironmentSample,
    provenance: Provenance,
) -> SensorReading {
    SensorReading {
        temperature: Metric::rounded(temperature_c),
        relative_humidity: Metric::from_option(sample.relative_humidity),
        pressure: Metric::from_option(sample.pressure_hpa),
        heat_index: Metric::from_option(
            sample
                .relative_humidity
                .map(|rh| heat_index_c(temperature_c, rh)),
        ),
        gas: Metric::from_option(sample.gas_ohms),
        iaq: Metric::from_option(sample.iaq),
        tvoc: Metric::from_option(sample.tvoc_ppb),
        eco2: Metric::from_option(sample.eco2_ppm),
        provenance,
    }
}

// NOAA heat index (Rothfusz regression with the simple-formula fallback),
// in Celsius rounded to a tenth.
pub fn heat_index_c(temperature_c: f32, relative_humidity: f32) -> f32 {
    let t = temperature_c * 9.0 / 5.0 + 32.0;
    let rh = relative_humidity;

    let simple = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);
    let hi_f = if (simple + t) / 2.0 < 80.0 {
        simple
    } else {
        let mut hi = -42.379 + 2.049_015_2 * t + 10.143_331 * rh
            - 0.224_755_41 * t * rh
            - 0.006_837_83 * t * t
            - 0.054_817_17 * rh * rh
            + 0.001_228_74 * t * t * rh
            + 0.000_852_82 * t * rh * rh
            - 0.000_001_99 * t * t * rh * rh;
        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 5.0);
        }
        hi
    };

    round_tenths((hi_f - 32.0) * 5.0 / 9.0)
}
