use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use embedded_hal::delay::DelayNs;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use garage_common::{
    door::check_door_state,
    sim::{HostThermometer, LoopbackRadio, ProcessReset, SimulatedSensor, SimulatedSonar, StdDelay},
    supervisor::{fail_safe_reboot, SERVICE_LOOP_YIELD_MS},
    ConnectionSupervisor, EnvironmentSample, FatalError, LocalEnvironment, NodeConfig,
    RemoteStatusRecord, ResetCause, SystemReset, FIRMWARE_VERSION, NOT_FOUND_BODY,
    ROUTE_API_STATUS,
};

const HOST_REFERENCE_FALLBACK_C: f32 = 38.0;
// Reads as closed with the default trigger distance.
const SIMULATED_SONAR_CM: f32 = 150.0;

struct SensorNode {
    environment: LocalEnvironment<HostThermometer, SimulatedSensor>,
    sonar: Option<SimulatedSonar>,
    trigger_distance_cm: f32,
}

impl SensorNode {
    fn new(
        reference: HostThermometer,
        sensor: Option<SimulatedSensor>,
        sonar: Option<SimulatedSonar>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            environment: LocalEnvironment::new(reference, sensor, &config.sensor1),
            sonar,
            trigger_distance_cm: config.trigger_distance_cm,
        }
    }

    // Sonar first, then the environment read with its dwell.
    fn status(&mut self) -> RemoteStatusRecord {
        let state = check_door_state(self.sonar.as_mut(), self.trigger_distance_cm, &mut StdDelay);
        let reading = self.environment.read(&mut StdDelay);
        RemoteStatusRecord::from_reading(state, &reading, Some(FIRMWARE_VERSION))
    }
}

type SharedNode = Arc<Mutex<SensorNode>>;

pub async fn run() -> anyhow::Result<()> {
    if let Err(err) = dotenvy::dotenv() {
        info!("no .env loaded ({err}); using process environment");
    }
    let (config, _problems) = NodeConfig::load(|key| std::env::var(key).ok());

    run_or_reboot(config, StdDelay, ProcessReset).await
}

async fn run_or_reboot<D, R>(config: NodeConfig, delay: D, reset: R) -> anyhow::Result<()>
where
    D: DelayNs + Clone + Send + 'static,
    R: SystemReset + Send + 'static,
{
    let outcome = start(config, delay.clone()).await;
    if let Err(err) = &outcome {
        let cause: &(dyn std::error::Error + 'static) = err.as_ref();
        let reason = FatalError::from_startup_error(cause);
        let (mut delay, mut reset) = (delay, reset);
        let rebooted =
            tokio::task::spawn_blocking(move || fail_safe_reboot(&mut delay, &mut reset, &reason))
                .await;
        if let Err(err) = rebooted {
            warn!("fail-safe reboot task failed: {err}");
        }
    }
    outcome
}

async fn start<D>(config: NodeConfig, delay: D) -> anyhow::Result<()>
where
    D: DelayNs + Send + 'static,
{
    let host_ip = std::env::var("GARAGE_HOST_IP")
        .ok()
        .and_then(|value| value.parse::<Ipv4Addr>().ok())
        .unwrap_or(Ipv4Addr::LOCALHOST);
    let credentials = config.wifi.clone();
    let mut supervisor = ConnectionSupervisor::new(LoopbackRadio::new(host_ip), delay);
    supervisor.recover_radio(ResetCause::PowerOn);

    let (supervisor, connected) = tokio::task::spawn_blocking(move || {
        let connected = supervisor.connect(credentials.as_ref());
        (supervisor, connected)
    })
    .await
    .context("wifi connect task failed")?;
    let ip = connected?;

    let sensor = config
        .sensor1
        .name
        .as_deref()
        .map(|model| SimulatedSensor::new(model, simulated_sample()));
    let sonar = match config.sonar_pins.as_slice() {
        [trigger, echo] => {
            info!("simulating HC-SR04 on trigger {trigger}, echo {echo}");
            Some(SimulatedSonar {
                distance_cm: SIMULATED_SONAR_CM,
            })
        }
        pins => {
            warn!("sonar_pins {pins:?} unusable; door state unavailable");
            None
        }
    };
    let node = SensorNode::new(
        HostThermometer::new(HOST_REFERENCE_FALLBACK_C),
        sensor,
        sonar,
        &config,
    );

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind sensor server at {addr}"))?;
    spawn_link_monitor(supervisor);

    let app = build_router(Arc::new(Mutex::new(node)));
    info!("remote sensor {ip} listening on http://{addr} (firmware {FIRMWARE_VERSION})");
    axum::serve(listener, app).await?;
    Ok(())
}

fn simulated_sample() -> EnvironmentSample {
    EnvironmentSample {
        temperature_c: 12.5,
        relative_humidity: Some(60.0),
        ..EnvironmentSample::default()
    }
}

fn build_router(node: SharedNode) -> Router {
    Router::new()
        .route(ROUTE_API_STATUS, get(handle_get_status))
        .fallback(handle_not_found)
        .with_state(node)
}

fn spawn_link_monitor<D>(mut supervisor: ConnectionSupervisor<LoopbackRadio, D>)
where
    D: DelayNs + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if let Err(err) = supervisor.check_link() {
                let rebooted = tokio::task::spawn_blocking(move || {
                    supervisor.fail_safe_reboot(&mut ProcessReset, &err)
                })
                .await;
                if let Err(err) = rebooted {
                    warn!("fail-safe reboot task failed: {err}");
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(SERVICE_LOOP_YIELD_MS)).await;
        }
    });
}

async fn handle_get_status(State(node): State<SharedNode>) -> axum::response::Response {
    let mut node = node.lock_owned().await;
    match tokio::task::spawn_blocking(move || node.status()).await {
        Ok(record) => {
            info!("status -> door {}", record.state.as_str());
            Json(record).into_response()
        }
        Err(err) => {
            warn!("status read failed: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, "sensor read failed").into_response()
        }
    }
}

async fn handle_not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}
