#[cfg(feature = "esp32")]
pub mod board;
pub mod calibration;
pub mod config;
pub mod door;
pub mod error;
pub mod remote;
pub mod routes;
pub mod sim;
pub mod status;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod testing;

pub use calibration::{
    CalibrationEngine, CalibrationState, EnvironmentSample, EnvironmentSensor, LocalEnvironment,
    ReferenceThermometer,
};
pub use config::{NodeConfig, SensorConfig, WifiCredentials};
pub use door::{ActuationQueue, DoorAction, DoorRelay, SonarProbe};
pub use error::{ConfigError, FatalError, RadioError, RelayError, RemoteFetchError, SensorError};
pub use remote::{PeerTransport, RemoteStatusClient};
pub use routes::*;
pub use status::{DeviceId, DeviceReport, DeviceTarget, StatusAggregator, StatusSnapshot};
pub use supervisor::{ConnectionState, ConnectionSupervisor, ResetCause, SystemReset, WifiRadio};
pub use types::{DoorState, Metric, Provenance, RemoteStatusRecord, SensorReading};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
