use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use embedded_hal::delay::DelayNs;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeFile;
use tracing::{info, warn};

use garage_common::{
    calibration::LocalEnvironment,
    door::actuation_sequence,
    remote::{peer_status_url, resolve_peer_response, PEER_TIMEOUT},
    sim::{HostThermometer, LoggingRelay, LoopbackRadio, ProcessReset, SimulatedSensor, StdDelay},
    status::handle_run,
    supervisor::{fail_safe_reboot, SERVICE_LOOP_YIELD_MS},
    ActuationQueue, ConnectionSupervisor, DeviceId, DeviceReport, DeviceTarget, DoorAction,
    DoorRelay, EnvironmentSample, FatalError, NodeConfig, RemoteFetchError, RemoteStatusRecord,
    ResetCause, SensorReading, StatusAggregator, SystemReset, FIRMWARE_VERSION, NOT_FOUND_BODY,
    PARAM_DEVICE_ID, ROUTE_API_RUN, ROUTE_API_STATUS, ROUTE_RUN, STATIC_ASSETS,
};

const HOST_REFERENCE_FALLBACK_C: f32 = 38.0;

// Status requests and door pulses take the same lock.
struct HubNode {
    environment: LocalEnvironment<HostThermometer, SimulatedSensor>,
    relay: LoggingRelay,
}

impl HubNode {
    fn new(reference: HostThermometer, sensor: Option<SimulatedSensor>, config: &NodeConfig) -> Self {
        Self {
            environment: LocalEnvironment::new(reference, sensor, &config.sensor1),
            relay: LoggingRelay::default(),
        }
    }

    fn read_environment(&mut self) -> SensorReading {
        self.environment.read(&mut StdDelay)
    }
}

#[derive(Clone)]
struct AppState {
    node: Arc<Mutex<HubNode>>,
    config: Arc<NodeConfig>,
    ip: Arc<str>,
    actuation: Arc<ActuationQueue>,
    http: reqwest::Client,
    peer_timeout: Duration,
}

impl AppState {
    fn new(node: HubNode, config: NodeConfig, ip: Ipv4Addr) -> Self {
        Self {
            node: Arc::new(Mutex::new(node)),
            config: Arc::new(config),
            ip: Arc::from(ip.to_string()),
            actuation: Arc::new(ActuationQueue::new()),
            http: peer_client(),
            peer_timeout: PEER_TIMEOUT,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

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
        reboot(delay, reset, FatalError::from_startup_error(cause)).await;
    }
    outcome
}

async fn reboot<D, R>(mut delay: D, mut reset: R, reason: FatalError)
where
    D: DelayNs + Send + 'static,
    R: SystemReset + Send + 'static,
{
    let rebooted =
        tokio::task::spawn_blocking(move || fail_safe_reboot(&mut delay, &mut reset, &reason))
            .await;
    if let Err(err) = rebooted {
        warn!("fail-safe reboot task failed: {err}");
    }
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

    let sensor = match config.sensor1.name.as_deref() {
        Some(model) => {
            info!("simulating {model} on pins {:?}", config.sensor1.pins);
            Some(SimulatedSensor::new(model, simulated_sample()))
        }
        None => {
            warn!("sensor1_name not set; reporting reference thermometer only");
            None
        }
    };
    let node = HubNode::new(
        HostThermometer::new(HOST_REFERENCE_FALLBACK_C),
        sensor,
        &config,
    );

    let port = config.http_port;
    let app_state = AppState::new(node, config, ip);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind hub server at {addr}"))?;

    spawn_control_loop(app_state.clone(), supervisor);
    let app = build_router(app_state, web_root());

    info!("hub listening on http://{addr} (firmware {FIRMWARE_VERSION})");
    axum::serve(listener, app).await?;
    Ok(())
}

fn web_root() -> PathBuf {
    PathBuf::from(format!("{}/web", env!("CARGO_MANIFEST_DIR")))
}

fn simulated_sample() -> EnvironmentSample {
    EnvironmentSample {
        temperature_c: 21.5,
        relative_humidity: Some(45.0),
        pressure_hpa: Some(1013.2),
        ..EnvironmentSample::default()
    }
}

fn build_router(app_state: AppState, web_root: PathBuf) -> Router {
    let mut router = Router::new()
        .route(ROUTE_API_STATUS, get(handle_get_status))
        .route(ROUTE_API_RUN, get(handle_run_door).post(handle_run_door))
        .route(ROUTE_RUN, get(handle_run_door).post(handle_run_door));

    for (route, file, _) in STATIC_ASSETS {
        let path = web_root.join(file);
        if path.is_file() {
            router = router.route_service(route, ServeFile::new(path));
        }
    }

    router.fallback(handle_not_found).with_state(app_state)
}

// Link check, queued door pulses, then yield.
fn spawn_control_loop<D>(
    app_state: AppState,
    mut supervisor: ConnectionSupervisor<LoopbackRadio, D>,
) where
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

            if app_state.actuation.take() {
                run_actuation(&app_state).await;
            }

            tokio::time::sleep(Duration::from_millis(SERVICE_LOOP_YIELD_MS)).await;
        }
    });
}

async fn run_actuation(app_state: &AppState) {
    let mut node = app_state.node.lock().await;
    info!("door actuation started");

    for action in actuation_sequence() {
        let result = match action {
            DoorAction::Assert => node.relay.set_asserted(true),
            DoorAction::Release => node.relay.set_asserted(false),
            DoorAction::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("door actuation step failed: {err}");
        }
    }
}

async fn handle_get_status(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let device = DeviceId::parse(params.get(PARAM_DEVICE_ID).map(String::as_str));
    let aggregator = StatusAggregator::new(&state.config, &state.ip, FIRMWARE_VERSION);

    let mut node = state.node.clone().lock_owned().await;
    let report = match device.target() {
        DeviceTarget::Local => {
            match tokio::task::spawn_blocking(move || node.read_environment()).await {
                Ok(reading) => DeviceReport::local(&reading),
                Err(err) => {
                    warn!("local sensor read failed: {err}");
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "sensor read failed",
                    );
                }
            }
        }
        DeviceTarget::Remote(_) => {
            let address = aggregator.peer_address(&device);
            let record = match address {
                Some(address) => fetch_peer(&state.http, address, state.peer_timeout).await,
                None => RemoteStatusRecord::sentinel(),
            };
            drop(node);
            DeviceReport::remote(address, record)
        }
    };

    let snapshot = aggregator.snapshot(&device, report, utc_nanos());
    info!(
        "status {} -> door {}",
        device.label(),
        snapshot.state.as_str()
    );
    Json(snapshot).into_response()
}

async fn handle_run_door(State(state): State<AppState>) -> impl IntoResponse {
    handle_run(&state.actuation)
}

async fn handle_not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

async fn fetch_peer(http: &reqwest::Client, address: &str, timeout: Duration) -> RemoteStatusRecord {
    let outcome = request_peer(http, &peer_status_url(address), timeout).await;
    resolve_peer_response(address, outcome)
}

async fn request_peer(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, RemoteFetchError> {
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(RemoteFetchError::Status(status.as_u16()));
    }

    let body = response.bytes().await.map_err(transport_error)?;
    Ok(body.to_vec())
}

// Peers live on the LAN; environment proxies never apply.
fn peer_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap_or_default()
}

fn transport_error(err: reqwest::Error) -> RemoteFetchError {
    if err.is_timeout() {
        RemoteFetchError::Timeout
    } else {
        RemoteFetchError::Transport(err.to_string())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn utc_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
